//! Administrative commands: user and group management, host lookups, log
//! files, the remote catalog and manual control of the event threshold.
//!
//! Only routers built with [`RouterBuilder::admin`](crate::core::router::RouterBuilder::admin)
//! serve these.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::backend::CallOptions;
use crate::commands::{call_options, opt_bool, opt_value, req_str};
use crate::core::acl::{Operation, ResourceKind, GROUP_PREFIX};
use crate::core::dispatcher::{CommandContext, HandlerResult};
use crate::core::lifecycle::qualify_user;
use crate::error::GatewayError;

pub const READ_LOGS_DEADLINE: Duration = Duration::from_millis(500);
pub const UPDATE_LICENSES_DEADLINE: Duration = Duration::from_millis(7000);

pub const META_UUID_ID: &str = "system.meta.uuid";
pub const LICENSES_ID: &str = "system.licenses";

const NAME_PATTERN: &str = r"^[-.A-Za-züäößÖÄÜа-яА-Я@+$§0-9=?!&# ]+$";

fn valid_name(name: &str) -> bool {
    static NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    NAME_RE
        .get_or_init(|| Regex::new(NAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

fn qualify_group(group: &str) -> String {
    if group.starts_with(GROUP_PREFIX) {
        group.to_string()
    } else {
        format!("{GROUP_PREFIX}{group}")
    }
}

fn is_protected(obj: &Value) -> bool {
    obj.pointer("/common/dontDelete").and_then(Value::as_bool).unwrap_or(false)
}

/// The ACL handed to new groups: list and read everywhere, nothing else.
pub fn default_group_acl() -> Value {
    let read = json!({"list": true, "read": true, "write": false, "create": false, "delete": false});
    json!({
        "object": read,
        "state": read,
        "file": read,
        "users": read,
        "other": {"execute": false, "http": false, "sendto": false},
    })
}

pub async fn add_user(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let name = req_str(&args, 0, "user name")?;
    let password = req_str(&args, 1, "password")?;
    if !valid_name(&name) {
        return Err(GatewayError::invalid(format!("Invalid characters in the name. Only following special characters are allowed: -@+$§=?!&# and letters: {name}")));
    }

    let id = qualify_user(&name);
    let opts = call_options(&ctx);
    let backend = ctx.router.backend();
    if backend.get_object(&id, &opts).await?.is_some() {
        return Err(GatewayError::Conflict(format!("User \"{name}\" already exists")));
    }

    let user = json!({
        "type": "user",
        "common": {"name": name, "enabled": true, "groups": []},
        "native": {},
    });
    backend.set_object(&id, user, &opts).await?;
    backend.set_password(&id, &password).await?;
    info!(user = %id, by = %ctx.connection.user(), "User created");
    Ok(Vec::new())
}

pub async fn del_user(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let name = req_str(&args, 0, "user name")?;
    let id = qualify_user(&name);
    let opts = call_options(&ctx);
    let backend = ctx.router.backend();

    let user = backend
        .get_object(&id, &opts)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("User \"{name}\" does not exist")))?;
    if is_protected(&user) {
        return Err(GatewayError::Conflict(format!("User \"{name}\" cannot be deleted")));
    }
    backend.del_object(&id, &opts).await?;

    let groups = backend.get_objects(&format!("{GROUP_PREFIX}*"), &opts).await?;
    for (group_id, mut group) in groups {
        let Some(members) = group.pointer_mut("/common/members").and_then(Value::as_array_mut) else {
            continue;
        };
        let before = members.len();
        members.retain(|m| m.as_str() != Some(id.as_str()));
        if members.len() != before {
            backend.set_object(&group_id, group, &opts).await?;
        }
    }
    info!(user = %id, by = %ctx.connection.user(), "User deleted");
    Ok(Vec::new())
}

pub async fn add_group(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let name = req_str(&args, 0, "group name")?;
    let id = qualify_group(&name);
    let short = id[GROUP_PREFIX.len()..].to_string();
    if short.is_empty() || !valid_name(&short) {
        return Err(GatewayError::invalid(format!("Invalid group name: {name}")));
    }
    let description = opt_value(&args, 1).unwrap_or(Value::String(String::new()));
    let acl = opt_value(&args, 2).unwrap_or_else(default_group_acl);

    let opts = call_options(&ctx);
    let backend = ctx.router.backend();
    if backend.get_object(&id, &opts).await?.is_some() {
        return Err(GatewayError::Conflict(format!("Group \"{short}\" already exists")));
    }
    let group = json!({
        "type": "group",
        "common": {"name": short, "description": description, "members": [], "acl": acl},
        "native": {},
    });
    backend.set_object(&id, group.clone(), &opts).await?;
    Ok(vec![group])
}

pub async fn del_group(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let name = req_str(&args, 0, "group name")?;
    let id = qualify_group(&name);
    let opts = call_options(&ctx);
    let backend = ctx.router.backend();

    let group = backend
        .get_object(&id, &opts)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("Group \"{name}\" does not exist")))?;
    if is_protected(&group) {
        return Err(GatewayError::Conflict(format!("Group \"{name}\" cannot be deleted")));
    }
    backend.del_object(&id, &opts).await?;
    Ok(Vec::new())
}

/// Anyone may change their own password; other users need `users.write`.
pub async fn change_password(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let user = qualify_user(&req_str(&args, 0, "user name")?);
    let password = req_str(&args, 1, "password")?;
    let acl = ctx.connection.acl();
    if acl.user != user && !acl.allows(ResourceKind::Users, Operation::Write) {
        return Err(GatewayError::PermissionDenied);
    }
    ctx.router.backend().set_password(&user, &password).await?;
    Ok(Vec::new())
}

fn host_has_address(host: &Value, ip: &str) -> bool {
    let listed = host
        .pointer("/common/address")
        .and_then(Value::as_array)
        .is_some_and(|addrs| addrs.iter().any(|a| a.as_str() == Some(ip)));
    if listed {
        return true;
    }
    host.pointer("/native/hardware/networkInterfaces")
        .and_then(Value::as_object)
        .is_some_and(|ifaces| {
            ifaces
                .values()
                .filter_map(Value::as_array)
                .flatten()
                .any(|iface| iface.get("address").and_then(Value::as_str) == Some(ip))
        })
}

pub async fn get_host_by_ip(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let ip = req_str(&args, 0, "ip")?;
    let hosts = ctx
        .router
        .backend()
        .get_objects("system.host.*", &call_options(&ctx))
        .await?;
    let host = hosts.into_values().find(|host| host_has_address(host, &ip));
    Ok(vec![json!(ip), host.unwrap_or(Value::Null)])
}

/// Asks the host for its log files. The host gets [`READ_LOGS_DEADLINE`] to
/// answer; after that the caller gets `timeout` with an empty list.
pub async fn read_logs(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let host = req_str(&args, 0, "host")?;
    let request = ctx.router.backend().send_to_host(&host, "getLogFiles", None);
    match tokio::time::timeout(READ_LOGS_DEADLINE, request).await {
        Ok(Ok(reply)) => {
            let list = match reply {
                Value::Object(mut map) => map.remove("list").unwrap_or_else(|| json!([])),
                other => other,
            };
            Ok(vec![list])
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            warn!(host = %host, "Host did not list its log files in time");
            Err(GatewayError::UpstreamTimeout {
                operation: "readLogs".to_string(),
                partial: Some(json!([])),
            })
        }
    }
}

pub async fn get_ratings(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let update = opt_bool(&args, 0).unwrap_or(false);
    if !update {
        if let Some(cached) = ctx.router.cached_ratings() {
            return Ok(vec![cached]);
        }
    }
    let catalog = ctx
        .router
        .catalog()
        .cloned()
        .ok_or_else(|| GatewayError::UpstreamFailure("Ratings service is not configured".to_string()))?;

    let meta = ctx
        .router
        .backend()
        .get_object(META_UUID_ID, &CallOptions::system())
        .await?;
    let uuid = meta
        .as_ref()
        .and_then(|m| m.pointer("/native/uuid"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::NotFound(format!("{META_UUID_ID} is not set")))?
        .to_string();

    let ratings = catalog.ratings(&uuid).await?;
    ctx.router.store_ratings(ratings.clone());
    Ok(vec![ratings])
}

/// Fetches the licenses of an account and stores them on `system.licenses`.
/// The whole exchange is bounded by [`UPDATE_LICENSES_DEADLINE`].
pub async fn update_licenses(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let login = req_str(&args, 0, "login")?;
    let password = req_str(&args, 1, "password")?;
    let catalog = ctx
        .router
        .catalog()
        .cloned()
        .ok_or_else(|| GatewayError::UpstreamFailure("License service is not configured".to_string()))?;
    let backend = ctx.router.backend().clone();
    let opts = call_options(&ctx);

    let exchange = async move {
        let licenses = catalog.licenses(&login, &password).await?;
        let mut obj = backend
            .get_object(LICENSES_ID, &opts)
            .await?
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({"type": "config", "common": {"name": "Licenses"}, "native": {}}));
        if !obj.get("native").is_some_and(Value::is_object) {
            obj["native"] = json!({});
        }
        obj["native"]["licenses"] = licenses.clone();
        obj["native"]["readTime"] = json!(chrono::Utc::now().to_rfc3339());
        backend.set_object(LICENSES_ID, obj, &opts).await?;
        Ok::<Value, GatewayError>(licenses)
    };

    match tokio::time::timeout(UPDATE_LICENSES_DEADLINE, exchange).await {
        Ok(result) => Ok(vec![result?]),
        Err(_) => Err(GatewayError::timeout("updateLicenses")),
    }
}

pub async fn events_threshold(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    match opt_bool(&args, 0) {
        Some(true) => ctx.router.enable_threshold().await,
        Some(false) => ctx.router.disable_threshold().await,
        None => return Err(GatewayError::invalid("Invalid isActive")),
    }
    Ok(vec![serde_json::to_value(ctx.router.threshold_snapshot())?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_allowed_alphabet() {
        assert!(valid_name("benjamin"));
        assert!(valid_name("Jörg Müller"));
        assert!(valid_name("ops@home"));
        assert!(!valid_name("a/b"));
        assert!(!valid_name(""));
    }

    #[test]
    fn hosts_match_on_either_address_list() {
        let by_common = json!({"common": {"address": ["10.0.0.2"]}});
        let by_iface = json!({"native": {"hardware": {"networkInterfaces": {
            "eth0": [{"address": "192.168.1.5", "family": "IPv4"}]
        }}}});
        assert!(host_has_address(&by_common, "10.0.0.2"));
        assert!(host_has_address(&by_iface, "192.168.1.5"));
        assert!(!host_has_address(&by_iface, "10.0.0.2"));
    }

    #[test]
    fn group_names_are_qualified_once() {
        assert_eq!(qualify_group("editors"), "system.group.editors");
        assert_eq!(qualify_group("system.group.editors"), "system.group.editors");
    }
}

//! # Command Sets
//!
//! Handlers grouped by what they touch. [`base_commands`] is what every router
//! serves; [`admin_commands`] is layered on top of it by
//! [`RouterBuilder::admin`](crate::core::router::RouterBuilder::admin), adding
//! and overriding entries rather than subclassing anything.
//!
//! Handlers receive their positional arguments as JSON values and answer with
//! the results that follow the error slot of the reply.

use serde_json::Value;

use crate::backend::CallOptions;
use crate::core::dispatcher::{handler, CommandContext, CommandTable};
use crate::error::GatewayError;

pub mod admin;
pub mod files;
pub mod messaging;
pub mod objects;
pub mod session;
pub mod states;

pub fn base_commands() -> CommandTable {
    CommandTable::new()
        // states
        .with("getStates", handler(states::get_states))
        .with("getForeignStates", handler(states::get_foreign_states))
        .with("getState", handler(states::get_state))
        .with("setState", handler(states::set_state))
        .with("delState", handler(states::del_state))
        .with("subscribe", handler(states::subscribe))
        .with("unsubscribe", handler(states::unsubscribe))
        // objects
        .with("getObject", handler(objects::get_object))
        .with("getObjects", handler(objects::get_objects))
        .with("setObject", handler(objects::set_object))
        .with("extendObject", handler(objects::extend_object))
        .with("delObject", handler(objects::del_object))
        .with("subscribeObjects", handler(objects::subscribe_objects))
        .with("unsubscribeObjects", handler(objects::unsubscribe_objects))
        // files
        .with("readDir", handler(files::read_dir))
        .with("readFile", handler(files::read_file))
        .with("readFile64", handler(files::read_file64))
        .with("writeFile", handler(files::write_file))
        .with("writeFile64", handler(files::write_file64))
        .with("deleteFile", handler(files::delete_file))
        .with("unlink", handler(files::delete_file))
        .with("rename", handler(files::rename))
        .with("fileExists", handler(files::file_exists))
        .with("subscribeFiles", handler(files::subscribe_files))
        .with("unsubscribeFiles", handler(files::unsubscribe_files))
        // messaging
        .with("sendTo", handler(messaging::send_to))
        .with("sendToHost", handler(messaging::send_to_host))
        .with("clientSubscribe", handler(messaging::client_subscribe))
        .with("clientUnsubscribe", handler(messaging::client_unsubscribe))
        // session and info
        .with("authEnabled", handler(session::auth_enabled))
        .with("getVersion", handler(session::get_version))
        .with("getAdapterName", handler(session::get_adapter_name))
        .with("name", handler(session::name))
        .with("listPermissions", handler(session::list_permissions))
        .with("getUserPermissions", handler(session::get_user_permissions))
        .with("logout", handler(session::logout))
        .with("disconnect", handler(session::disconnect))
        .with("requireLog", handler(session::require_log))
        .with("checkFeatureSupported", handler(session::check_feature_supported))
}

pub fn admin_commands() -> CommandTable {
    CommandTable::new()
        .with("addUser", handler(admin::add_user))
        .with("delUser", handler(admin::del_user))
        .with("addGroup", handler(admin::add_group))
        .with("delGroup", handler(admin::del_group))
        .with("changePassword", handler(admin::change_password))
        .with("getHostByIp", handler(admin::get_host_by_ip))
        .with("readLogs", handler(admin::read_logs))
        .with("getRatings", handler(admin::get_ratings))
        .with("updateLicenses", handler(admin::update_licenses))
        .with("eventsThreshold", handler(admin::events_threshold))
}

// --- Argument helpers ---

pub(crate) fn opt_value(args: &[Value], index: usize) -> Option<Value> {
    args.get(index).filter(|v| !v.is_null()).cloned()
}

pub(crate) fn opt_str(args: &[Value], index: usize) -> Option<String> {
    args.get(index).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn req_str(args: &[Value], index: usize, what: &str) -> Result<String, GatewayError> {
    match opt_str(args, index) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(GatewayError::invalid(format!("Invalid {what}"))),
    }
}

pub(crate) fn opt_bool(args: &[Value], index: usize) -> Option<bool> {
    args.get(index).and_then(Value::as_bool)
}

/// A single pattern or a list of them; absent means `*`.
pub(crate) fn patterns(args: &[Value], index: usize) -> Result<Vec<String>, GatewayError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(vec!["*".to_string()]),
        Some(Value::String(p)) => Ok(vec![p.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| GatewayError::invalid("Invalid pattern"))
            })
            .collect(),
        Some(_) => Err(GatewayError::invalid("Invalid pattern")),
    }
}

/// Like [`patterns`], but an explicit empty list is rejected: a query needs
/// at least one pattern to run.
pub(crate) fn query_patterns(args: &[Value], index: usize) -> Result<Vec<String>, GatewayError> {
    let patterns = patterns(args, index)?;
    if patterns.is_empty() {
        return Err(GatewayError::invalid("Invalid pattern"));
    }
    Ok(patterns)
}

pub(crate) fn call_options(ctx: &CommandContext) -> CallOptions {
    CallOptions::from_acl(&ctx.connection.acl())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patterns_accept_string_list_or_nothing() {
        assert_eq!(patterns(&[], 0).unwrap(), vec!["*"]);
        assert_eq!(patterns(&[json!("a.*")], 0).unwrap(), vec!["a.*"]);
        assert_eq!(patterns(&[json!(["a.*", "b"])], 0).unwrap(), vec!["a.*", "b"]);
        assert!(patterns(&[json!(3)], 0).is_err());
        assert!(patterns(&[json!(["a", 1])], 0).is_err());
    }

    #[test]
    fn query_patterns_need_at_least_one() {
        assert_eq!(query_patterns(&[], 0).unwrap(), vec!["*"]);
        assert_eq!(query_patterns(&[json!(["a.*", "b.*"])], 0).unwrap(), vec!["a.*", "b.*"]);
        let err = query_patterns(&[json!([])], 0).unwrap_err();
        assert_eq!(err.to_string(), "Invalid pattern");
    }

    #[test]
    fn required_strings_must_be_present() {
        assert_eq!(req_str(&[json!("x")], 0, "id").unwrap(), "x");
        let err = req_str(&[json!("")], 0, "id").unwrap_err();
        assert_eq!(err.to_string(), "Invalid id");
        assert!(req_str(&[], 0, "id").is_err());
    }

    #[test]
    fn base_and_admin_tables_are_disjoint_except_overrides() {
        let base = base_commands();
        let admin = admin_commands();
        assert!(base.contains("unlink"));
        assert!(!base.contains("addUser"));
        assert!(admin.contains("readLogs"));
    }
}

//! Object commands. Besides the section ACL checked by the dispatcher, every
//! object carrying its own `acl` is checked against the caller here.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::commands::{call_options, patterns, query_patterns, req_str};
use crate::core::acl::{check_object, AccessFlag, ResourceKind};
use crate::core::dispatcher::{CommandContext, HandlerResult};
use crate::core::registry::{EventKind, SubscriptionKey};
use crate::error::GatewayError;

fn may(ctx: &CommandContext, obj: &Value, flag: AccessFlag) -> Result<(), GatewayError> {
    if check_object(obj, &ctx.connection.acl(), ResourceKind::Object, flag) {
        Ok(())
    } else {
        Err(GatewayError::PermissionDenied)
    }
}

pub async fn get_object(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    match ctx.router.backend().get_object(&id, &call_options(&ctx)).await? {
        Some(obj) => {
            may(&ctx, &obj, AccessFlag::Read)?;
            Ok(vec![obj])
        }
        None => Ok(vec![Value::Null]),
    }
}

/// Objects the caller may not read are left out rather than failing the call.
pub async fn get_objects(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let acl = ctx.connection.acl();
    let opts = call_options(&ctx);
    let mut objects = BTreeMap::new();
    for pattern in query_patterns(&args, 0)? {
        objects.extend(ctx.router.backend().get_objects(&pattern, &opts).await?);
    }
    objects.retain(|_, obj| check_object(obj, &acl, ResourceKind::Object, AccessFlag::Read));
    Ok(vec![serde_json::to_value(objects)?])
}

pub async fn set_object(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let obj = match args.get(1) {
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => return Err(GatewayError::invalid("Invalid object")),
    };
    let opts = call_options(&ctx);
    if let Some(existing) = ctx.router.backend().get_object(&id, &opts).await? {
        may(&ctx, &existing, AccessFlag::Write)?;
    }
    ctx.router.backend().set_object(&id, obj, &opts).await?;
    Ok(vec![json!({"id": id})])
}

/// Recursively merges `patch` into `target`. Non-object values replace.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => deep_merge(existing, value),
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

pub async fn extend_object(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let patch = match args.get(1) {
        Some(patch @ Value::Object(_)) => patch.clone(),
        _ => return Err(GatewayError::invalid("Invalid object")),
    };
    let opts = call_options(&ctx);
    let mut obj = match ctx.router.backend().get_object(&id, &opts).await? {
        Some(existing) => {
            may(&ctx, &existing, AccessFlag::Write)?;
            existing
        }
        None => Value::Object(Map::new()),
    };
    deep_merge(&mut obj, patch);
    ctx.router.backend().set_object(&id, obj.clone(), &opts).await?;
    Ok(vec![obj])
}

pub async fn del_object(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let opts = call_options(&ctx);
    let existing = ctx
        .router
        .backend()
        .get_object(&id, &opts)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("Object {id} not found")))?;
    may(&ctx, &existing, AccessFlag::Write)?;
    ctx.router.backend().del_object(&id, &opts).await?;
    Ok(Vec::new())
}

pub async fn subscribe_objects(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let conn = ctx.connection.id();
    for pattern in patterns(&args, 0)? {
        ctx.router
            .subscribe(Some(conn), SubscriptionKey::new(EventKind::ObjectChange, pattern))
            .await?;
    }
    Ok(Vec::new())
}

pub async fn unsubscribe_objects(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let conn = ctx.connection.id();
    for pattern in patterns(&args, 0)? {
        ctx.router
            .unsubscribe(Some(conn), &SubscriptionKey::new(EventKind::ObjectChange, pattern))
            .await;
    }
    Ok(Vec::new())
}

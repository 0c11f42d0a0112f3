//! Session and info commands.

use serde_json::{json, Value};
use tracing::info;

use crate::backend::TOKEN_KEY_PREFIX;
use crate::commands::{opt_bool, req_str};
use crate::core::dispatcher::{CommandContext, HandlerResult};
use crate::core::router::log_key;
use crate::error::GatewayError;

/// Features a client may ask about with `checkFeatureSupported`.
pub const SUPPORTED_FEATURES: &[&str] = &[
    "ALIAS",
    "INSTANCE_MESSAGES",
    "FILE_SUBSCRIPTIONS",
    "EVENTS_THRESHOLD",
    "PERMISSION_TABLE",
];

pub async fn auth_enabled(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    let acl = ctx.connection.acl();
    Ok(vec![json!(ctx.router.settings().auth), json!(acl.short_user())])
}

pub async fn get_version(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    Ok(vec![json!(ctx.router.settings().version)])
}

pub async fn get_adapter_name(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    Ok(vec![json!(ctx.router.settings().adapter_name)])
}

pub async fn name(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let display = req_str(&args, 0, "name")?;
    ctx.connection.set_name(display);
    Ok(Vec::new())
}

pub async fn list_permissions(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    Ok(vec![ctx.router.permissions().to_value()])
}

pub async fn get_user_permissions(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    Ok(vec![serde_json::to_value(ctx.connection.acl())?])
}

/// Destroys the session behind the connection. The socket stays open; the
/// next command finds the session gone.
pub async fn logout(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    let key = match (ctx.connection.token(), ctx.connection.session_id()) {
        (Some(token), _) => format!("{TOKEN_KEY_PREFIX}{token}"),
        (None, Some(session_id)) => session_id,
        (None, None) => return Err(GatewayError::invalid("No session")),
    };
    ctx.router.session_store().destroy(&key).await?;
    info!(conn = ctx.connection.id(), user = %ctx.connection.user(), "Logged out");
    Ok(Vec::new())
}

pub async fn disconnect(ctx: CommandContext, _args: Vec<Value>) -> HandlerResult {
    ctx.connection.close();
    Ok(Vec::new())
}

/// `requireLog(true)` starts log streaming for this connection, `false` stops it.
pub async fn require_log(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let conn = ctx.connection.id();
    if opt_bool(&args, 0).unwrap_or(false) {
        ctx.router.subscribe(Some(conn), log_key()).await?;
    } else {
        ctx.router.unsubscribe(Some(conn), &log_key()).await;
    }
    Ok(Vec::new())
}

pub async fn check_feature_supported(_ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let feature = req_str(&args, 0, "feature")?;
    Ok(vec![json!(SUPPORTED_FEATURES.contains(&feature.as_str()))])
}

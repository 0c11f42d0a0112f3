//! Messages to adapter instances and hosts, and per-connection instance
//! message subscriptions.

use serde_json::{json, Value};
use tracing::debug;

use crate::commands::{opt_str, opt_value, req_str};
use crate::core::dispatcher::{CommandContext, HandlerResult};
use crate::error::GatewayError;

pub async fn send_to(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let instance = req_str(&args, 0, "instance")?;
    let command = opt_str(&args, 1).unwrap_or_else(|| "send".to_string());
    let message = opt_value(&args, 2).unwrap_or(Value::Null);
    let reply = ctx.router.backend().send_to(&instance, &command, message).await?;
    Ok(vec![reply])
}

/// Argument-free status queries are answered from the host cache.
pub async fn send_to_host(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let host = req_str(&args, 0, "host")?;
    let command = req_str(&args, 1, "command")?;
    let message = opt_value(&args, 2);
    let backend = ctx.router.backend().clone();
    let reply = ctx
        .router
        .host_cache()
        .get_or_fetch(&host, &command, message.as_ref(), || {
            let host = host.clone();
            let command = command.clone();
            let message = message.clone();
            async move {
                backend
                    .send_to_host(&host, &command, message)
                    .await
                    .map_err(GatewayError::from)
            }
        })
        .await?;
    Ok(vec![reply])
}

/// Registers for `im` events from an instance and tells the instance about it.
/// The registration is rolled back when the instance does not answer.
pub async fn client_subscribe(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let instance = req_str(&args, 0, "instance")?;
    let message_type = req_str(&args, 1, "message type")?;
    let data = opt_value(&args, 2).unwrap_or(Value::Null);
    let conn = ctx.connection.id();

    ctx.router.subscribe_instance(conn, &instance, &message_type)?;
    let request = json!({"type": message_type, "data": data, "sid": conn});
    match ctx.router.backend().send_to(&instance, "clientSubscribe", request).await {
        Ok(reply) => Ok(vec![reply]),
        Err(e) => {
            ctx.router.unsubscribe_instance(conn, &instance, Some(&message_type));
            Err(e.into())
        }
    }
}

pub async fn client_unsubscribe(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let instance = req_str(&args, 0, "instance")?;
    let message_type = opt_str(&args, 1);
    let conn = ctx.connection.id();

    ctx.router
        .unsubscribe_instance(conn, &instance, message_type.as_deref());
    let request = json!({"type": message_type, "sid": conn});
    if let Err(e) = ctx.router.backend().send_to(&instance, "clientUnsubscribe", request).await {
        debug!(conn, instance = %instance, error = %e, "Instance did not acknowledge unsubscribe");
    }
    Ok(Vec::new())
}

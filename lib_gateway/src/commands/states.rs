//! State reads and writes, and `stateChange` subscriptions.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::commands::{call_options, patterns, query_patterns, req_str};
use crate::core::dispatcher::{CommandContext, HandlerResult};
use crate::core::registry::{EventKind, SubscriptionKey};
use crate::error::GatewayError;

/// Several patterns are queried one by one and merged into one map.
pub async fn get_states(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let opts = call_options(&ctx);
    let mut states = BTreeMap::new();
    for pattern in query_patterns(&args, 0)? {
        states.extend(ctx.router.backend().get_states(&pattern, &opts).await?);
    }
    Ok(vec![serde_json::to_value(states)?])
}

pub async fn get_foreign_states(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let pattern = req_str(&args, 0, "pattern")?;
    let states = ctx.router.backend().get_states(&pattern, &call_options(&ctx)).await?;
    Ok(vec![serde_json::to_value(states)?])
}

pub async fn get_state(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let state = ctx.router.backend().get_state(&id, &call_options(&ctx)).await?;
    Ok(vec![state.unwrap_or(Value::Null)])
}

/// Plain values are stored as `{val, ack: false}`.
pub fn normalize_state(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({"val": other, "ack": false}),
    }
}

pub async fn set_state(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let state = match args.get(1) {
        Some(value) => normalize_state(value.clone()),
        None => return Err(GatewayError::invalid("Invalid state")),
    };
    ctx.router.backend().set_state(&id, state, &call_options(&ctx)).await?;
    Ok(vec![json!(id)])
}

pub async fn del_state(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    ctx.router.backend().del_state(&id, &call_options(&ctx)).await?;
    Ok(Vec::new())
}

pub async fn subscribe(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let conn = ctx.connection.id();
    for pattern in patterns(&args, 0)? {
        ctx.router
            .subscribe(Some(conn), SubscriptionKey::new(EventKind::StateChange, pattern))
            .await?;
    }
    Ok(Vec::new())
}

pub async fn unsubscribe(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let conn = ctx.connection.id();
    for pattern in patterns(&args, 0)? {
        ctx.router
            .unsubscribe(Some(conn), &SubscriptionKey::new(EventKind::StateChange, pattern))
            .await;
    }
    Ok(Vec::new())
}

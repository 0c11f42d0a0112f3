//! File commands, addressed by `(id, name)` where `id` is the owning
//! adapter or device. Binary content travels as base64 in `*64` variants.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::commands::{call_options, patterns, req_str};
use crate::core::dispatcher::{CommandContext, HandlerResult};
use crate::core::registry::SubscriptionKey;
use crate::error::GatewayError;

fn data_arg(args: &[Value], index: usize) -> Result<&str, GatewayError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::invalid("Invalid data"))
}

pub async fn read_dir(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let path = args.get(1).and_then(Value::as_str).unwrap_or("");
    let entries = ctx.router.backend().read_dir(&id, path, &call_options(&ctx)).await?;
    Ok(vec![serde_json::to_value(entries)?])
}

/// Replies `(text, mimeType)`. Binary content is decoded lossily.
pub async fn read_file(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let name = req_str(&args, 1, "file name")?;
    let file = ctx.router.backend().read_file(&id, &name, &call_options(&ctx)).await?;
    Ok(vec![
        json!(String::from_utf8_lossy(&file.data)),
        file.mime_type.map_or(Value::Null, Value::String),
    ])
}

pub async fn read_file64(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let name = req_str(&args, 1, "file name")?;
    let file = ctx.router.backend().read_file(&id, &name, &call_options(&ctx)).await?;
    Ok(vec![
        json!(STANDARD.encode(&file.data)),
        file.mime_type.map_or(Value::Null, Value::String),
    ])
}

pub async fn write_file(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let name = req_str(&args, 1, "file name")?;
    let data = data_arg(&args, 2)?.as_bytes().to_vec();
    ctx.router
        .backend()
        .write_file(&id, &name, data, &call_options(&ctx))
        .await?;
    Ok(Vec::new())
}

pub async fn write_file64(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let name = req_str(&args, 1, "file name")?;
    let data = STANDARD
        .decode(data_arg(&args, 2)?)
        .map_err(|e| GatewayError::invalid(format!("Invalid base64: {e}")))?;
    ctx.router
        .backend()
        .write_file(&id, &name, data, &call_options(&ctx))
        .await?;
    Ok(Vec::new())
}

pub async fn delete_file(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let name = req_str(&args, 1, "file name")?;
    ctx.router.backend().delete_file(&id, &name, &call_options(&ctx)).await?;
    Ok(Vec::new())
}

pub async fn rename(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let old_name = req_str(&args, 1, "file name")?;
    let new_name = req_str(&args, 2, "new file name")?;
    ctx.router
        .backend()
        .rename_file(&id, &old_name, &new_name, &call_options(&ctx))
        .await?;
    Ok(Vec::new())
}

pub async fn file_exists(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let name = req_str(&args, 1, "file name")?;
    let exists = ctx.router.backend().file_exists(&id, &name, &call_options(&ctx)).await?;
    Ok(vec![json!(exists)])
}

pub async fn subscribe_files(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let conn = ctx.connection.id();
    for file_pattern in patterns(&args, 1)? {
        ctx.router
            .subscribe(Some(conn), SubscriptionKey::file(id.as_str(), file_pattern))
            .await?;
    }
    Ok(Vec::new())
}

pub async fn unsubscribe_files(ctx: CommandContext, args: Vec<Value>) -> HandlerResult {
    let id = req_str(&args, 0, "id")?;
    let conn = ctx.connection.id();
    for file_pattern in patterns(&args, 1)? {
        ctx.router
            .unsubscribe(Some(conn), &SubscriptionKey::file(id.as_str(), file_pattern))
            .await;
    }
    Ok(Vec::new())
}

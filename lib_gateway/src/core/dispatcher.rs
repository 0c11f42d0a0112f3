//! # Command Dispatcher
//!
//! Holds the command table and runs one command for one connection:
//!
//! 1. Look the handler up. Unknown names are rejected.
//! 2. Look the name up in the [`PermissionTable`]. A missing rule means the
//!    command is unguarded; a rule is checked against the connection's ACL and
//!    a denial replies `permissionError` without ever touching the handler.
//! 3. Run the handler. A panic is caught, logged, and answered with a generic
//!    failure naming only the command. This needs `panic = "unwind"`, which
//!    the workspace release profile keeps.
//! 4. Normalize the outcome into a [`CommandReply`]: an error string or
//!    `null`, followed by the results.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::core::connection::Connection;
use crate::core::permissions::{PermissionTable, Requirement};
use crate::core::router::Router;
use crate::error::GatewayError;

pub type HandlerResult = Result<Vec<Value>, GatewayError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
pub type CommandHandler = Arc<dyn Fn(CommandContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Wraps an async function into a [`CommandHandler`].
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(CommandContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(f(ctx, args)))
}

/// What a handler gets to work with.
#[derive(Clone)]
pub struct CommandContext {
    pub router: Arc<Router>,
    pub connection: Arc<Connection>,
}

/// `[error, ...results]` once flattened for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub error: Option<String>,
    pub results: Vec<Value>,
}

impl CommandReply {
    pub fn ok(results: Vec<Value>) -> Self {
        Self { error: None, results }
    }

    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            error: Some(err.to_string()),
            results: err.partial_results(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_args(self) -> Vec<Value> {
        let mut args = Vec::with_capacity(self.results.len() + 1);
        args.push(self.error.map_or(Value::Null, Value::String));
        args.extend(self.results);
        args
    }
}

impl From<HandlerResult> for CommandReply {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(results) => CommandReply::ok(results),
            Err(err) => CommandReply::from_error(&err),
        }
    }
}

/// Name -> handler. Composed by extension: later registrations override.
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: CommandHandler) -> &mut Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn with(mut self, name: &str, handler: CommandHandler) -> Self {
        self.register(name, handler);
        self
    }

    /// Adds every entry of `other`, replacing existing names.
    pub fn extend(&mut self, other: CommandTable) {
        self.handlers.extend(other.handlers);
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct CommandDispatcher {
    table: RwLock<CommandTable>,
    permissions: PermissionTable,
}

impl CommandDispatcher {
    pub fn new(table: CommandTable, permissions: PermissionTable) -> Self {
        Self {
            table: RwLock::new(table),
            permissions,
        }
    }

    pub fn register(&self, name: &str, handler: CommandHandler) {
        self.table.write().register(name, handler);
    }

    pub fn permissions(&self) -> &PermissionTable {
        &self.permissions
    }

    pub fn commands(&self) -> Vec<String> {
        self.table.read().names()
    }

    /// Checks `name` against the connection's ACL.
    pub fn check_permission(&self, connection: &Connection, name: &str) -> Result<(), GatewayError> {
        match self.permissions.lookup(name) {
            None => {
                debug!(command = name, "No permission rule, command is unguarded");
                Ok(())
            }
            Some(Requirement::Unrestricted) => Ok(()),
            Some(Requirement::Needs(kind, op)) => {
                let acl = connection.acl();
                if acl.allows(kind, op) {
                    Ok(())
                } else {
                    warn!(
                        user = %acl.user,
                        command = name,
                        required = %format!("{}.{}", kind.as_str(), op.as_str()),
                        "Permission denied"
                    );
                    Err(GatewayError::PermissionDenied)
                }
            }
        }
    }

    pub async fn dispatch(&self, ctx: CommandContext, name: &str, args: Vec<Value>) -> CommandReply {
        let found = self.table.read().get(name);
        let Some(handler) = found else {
            return CommandReply::from_error(&GatewayError::UnknownCommand(name.to_string()));
        };
        if let Err(err) = self.check_permission(&ctx.connection, name) {
            return CommandReply::from_error(&err);
        }

        let conn_id = ctx.connection.id();
        match AssertUnwindSafe(handler(ctx, args)).catch_unwind().await {
            Ok(result) => result.into(),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(conn = conn_id, command = name, panic = %message, "Command handler panicked");
                CommandReply::from_error(&GatewayError::UpstreamFailure(format!("Command {name} failed")))
            }
        }
    }
}

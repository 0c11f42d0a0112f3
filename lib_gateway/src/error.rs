//! # Gateway Errors
//!
//! Every command failure is one of the variants below. On the wire an error is
//! always the `Display` string of the variant, never a structured object.

use serde_json::Value;
use thiserror::Error;

use crate::backend::BackendError;

/// The string clients receive when a permission check fails.
pub const ERROR_PERMISSION: &str = "permissionError";

/// The out-of-band event asking a client to re-establish its identity.
pub const COMMAND_RE_AUTHENTICATE: &str = "reauthenticate";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// The ACL check failed. The handler was never invoked.
    #[error("permissionError")]
    PermissionDenied,

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// A deadline fired before the upstream answered. `partial` is whatever
    /// could be synthesized locally and is sent along with the error.
    #[error("timeout")]
    UpstreamTimeout {
        operation: String,
        partial: Option<Value>,
    },

    #[error("{0}")]
    UpstreamFailure(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("reauthenticate")]
    Unauthenticated,
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        GatewayError::InvalidInput(message.into())
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        GatewayError::UpstreamTimeout {
            operation: operation.into(),
            partial: None,
        }
    }

    /// Results that accompany the error string in the reply, if any.
    pub fn partial_results(&self) -> Vec<Value> {
        match self {
            GatewayError::UpstreamTimeout {
                partial: Some(value),
                ..
            } => vec![value.clone()],
            _ => Vec::new(),
        }
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(what) => GatewayError::NotFound(what),
            BackendError::Timeout => GatewayError::timeout("backend"),
            BackendError::Failure(message) => GatewayError::UpstreamFailure(message),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::UpstreamFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permission_error_renders_wire_constant() {
        assert_eq!(GatewayError::PermissionDenied.to_string(), ERROR_PERMISSION);
    }

    #[test]
    fn timeout_carries_partial_results() {
        let err = GatewayError::UpstreamTimeout {
            operation: "readLogs".into(),
            partial: Some(json!([])),
        };
        assert_eq!(err.to_string(), "timeout");
        assert_eq!(err.partial_results(), vec![json!([])]);
    }

    #[test]
    fn backend_errors_map_onto_taxonomy() {
        let not_found: GatewayError = BackendError::NotFound("system.user.x".into()).into();
        assert_eq!(not_found, GatewayError::NotFound("system.user.x".into()));

        let failure: GatewayError = BackendError::Failure("disk full".into()).into();
        assert_eq!(failure.to_string(), "disk full");
    }
}

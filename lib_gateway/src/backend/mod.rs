//! # Backend Collaborators
//!
//! The gateway never owns data. Objects, states, files, sessions and the
//! permission calculation all live behind the traits in this module:
//!
//! - [`Backend`]: the data/control plane (objects, states, files, upstream
//!   interest, messaging, permission calculation).
//! - [`SessionStore`]: lookups of session ids and `"a:" + token` keys.
//! - [`RemoteCatalog`]: the remote ratings and licensing services.
//!
//! [`memory`] carries complete in-memory implementations used by the tests and
//! by the development server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::acl::Acl;
use crate::core::registry::EventKind;

/// In-memory backend and session store.
pub mod memory;

pub use memory::{MemoryBackend, MemorySessionStore, Seed};

/// Prefix of the session-store key under which bearer tokens are kept.
pub const TOKEN_KEY_PREFIX: &str = "a:";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Failure(String),

    #[error("timeout")]
    Timeout,
}

/// Identity on whose behalf a backend call is made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub user: String,
    pub groups: Vec<String>,
}

impl CallOptions {
    pub fn from_acl(acl: &Acl) -> Self {
        Self {
            user: acl.user.clone(),
            groups: acl.groups.clone(),
        }
    }

    /// The gateway acting for itself.
    pub fn system() -> Self {
        Self {
            user: crate::core::acl::SUPER_USER.to_string(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file: String,
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

/// Contents of a file plus its MIME type, when known.
#[derive(Debug, Clone, PartialEq)]
pub struct FileData {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
}

/// A change notification raised by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    StateChange { id: String, state: Option<Value> },
    ObjectChange { id: String, obj: Option<Value> },
    FileChange {
        id: String,
        file_name: String,
        size: Option<u64>,
    },
    Log(Value),
}

/// Out-of-band instructions about sessions, delivered through `send_command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCommand {
    UpdateTokenExpiration { token: String, expires_at_ms: i64 },
    Logout { token: String },
}

/// What the session store knows about a session id or token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Computes the permission set of `user` (a full `system.user.*` id).
    async fn calculate_acl(&self, user: &str) -> Result<Acl, BackendError>;

    /// Starts delivering changes of `kind` matching `pattern` upstream.
    async fn subscribe(
        &self,
        kind: EventKind,
        pattern: &str,
        file_pattern: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn unsubscribe(
        &self,
        kind: EventKind,
        pattern: &str,
        file_pattern: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn get_object(&self, id: &str, opts: &CallOptions) -> Result<Option<Value>, BackendError>;
    async fn get_objects(
        &self,
        pattern: &str,
        opts: &CallOptions,
    ) -> Result<BTreeMap<String, Value>, BackendError>;
    async fn set_object(&self, id: &str, obj: Value, opts: &CallOptions) -> Result<(), BackendError>;
    async fn del_object(&self, id: &str, opts: &CallOptions) -> Result<(), BackendError>;

    async fn get_state(&self, id: &str, opts: &CallOptions) -> Result<Option<Value>, BackendError>;
    async fn get_states(
        &self,
        pattern: &str,
        opts: &CallOptions,
    ) -> Result<BTreeMap<String, Value>, BackendError>;
    async fn set_state(&self, id: &str, state: Value, opts: &CallOptions) -> Result<(), BackendError>;
    async fn del_state(&self, id: &str, opts: &CallOptions) -> Result<(), BackendError>;

    async fn read_dir(
        &self,
        id: &str,
        path: &str,
        opts: &CallOptions,
    ) -> Result<Vec<FileEntry>, BackendError>;
    async fn read_file(&self, id: &str, name: &str, opts: &CallOptions) -> Result<FileData, BackendError>;
    async fn write_file(
        &self,
        id: &str,
        name: &str,
        data: Vec<u8>,
        opts: &CallOptions,
    ) -> Result<(), BackendError>;
    async fn delete_file(&self, id: &str, name: &str, opts: &CallOptions) -> Result<(), BackendError>;
    async fn rename_file(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        opts: &CallOptions,
    ) -> Result<(), BackendError>;
    async fn file_exists(&self, id: &str, name: &str, opts: &CallOptions) -> Result<bool, BackendError>;

    /// Sends a message to an adapter instance and waits for its answer.
    async fn send_to(&self, instance: &str, command: &str, message: Value) -> Result<Value, BackendError>;

    /// Sends a command to a host process and waits for its answer.
    async fn send_to_host(
        &self,
        host: &str,
        command: &str,
        message: Option<Value>,
    ) -> Result<Value, BackendError>;

    async fn set_password(&self, user: &str, password: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, BackendError>;
    /// Extends the lifetime of `key` by `ttl`.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<(), BackendError>;
    async fn destroy(&self, key: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn ratings(&self, uuid: &str) -> Result<Value, BackendError>;
    async fn licenses(&self, login: &str, password: &str) -> Result<Value, BackendError>;
}

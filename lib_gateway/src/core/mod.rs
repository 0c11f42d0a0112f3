//! # Core Engine Module
//!
//! Everything between the transport and the backend. Leaves first:
//!
//! - **`acl`**: resolved per-connection permissions and the owner/group/everyone
//!   bitmask check for individual resources.
//! - **`permissions`**: command name -> required `{kind, operation}`.
//! - **`pattern`** / **`whitelist`**: glob matching and IP-based ACL narrowing.
//! - **`registry`**: reference-counted subscriptions with a per-connection
//!   reverse index.
//! - **`connection`** / **`lifecycle`**: connection records, authentication and
//!   session freshness.
//! - **`dispatcher`**: the permission-checked command table.
//! - **`threshold`**: the event-storm breaker.
//! - **`host_cache`**: short-lived answers to host commands.
//! - **`router`**: owns all of the above for one gateway instance.

pub mod acl;
pub mod connection;
/// Runs commands after checking them against the permission table.
pub mod dispatcher;
/// Short-TTL cache in front of host round-trips.
pub mod host_cache;
/// Connection authentication and session refresh.
pub mod lifecycle;
pub mod pattern;
pub mod permissions;
/// Reference-counted subscriptions.
pub mod registry;
pub mod router;
/// Event-storm circuit breaker.
pub mod threshold;
pub mod whitelist;

// --- Public API Re-exports ---
pub use acl::{Acl, Operation, ResourceKind};
pub use connection::{ConnectRequest, Connection, ConnectionId, ConnectionPhase, Credential, Outbound};
pub use dispatcher::{handler, CommandContext, CommandHandler, CommandReply, CommandTable};
pub use registry::{EventKind, SubscriptionKey};
pub use router::{Router, RouterBuilder};

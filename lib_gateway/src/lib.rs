//! # lib_gateway
//!
//! The engine behind the command/event gateway. It sits between many concurrent
//! client connections and a backend data/control plane: clients call named
//! commands and receive a filtered stream of state, object, file and log
//! changes.
//!
//! The transport (accepting sockets, framing) and the backend (objects, states,
//! files, sessions) are collaborators reached through the traits in [`backend`].
//! Everything in between lives in [`core`]:
//!
//! - **`acl`** / **`permissions`** / **`whitelist`**: who may do what.
//! - **`registry`**: reference-counted subscriptions and the per-connection reverse index.
//! - **`lifecycle`**: authentication and session freshness for each connection.
//! - **`dispatcher`**: the permission-checked command table.
//! - **`threshold`**: the event-storm circuit breaker.
//! - **`host_cache`**: short-lived memoization of host round-trips.
//! - **`router`**: the long-lived owner of all of the above.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Backend collaborator seams and an in-memory implementation.
pub mod backend;
/// Command handlers grouped by resource, and the base/admin command sets.
pub mod commands;
/// Gateway settings.
pub mod configs;
/// The gateway engine.
pub mod core;
/// Error taxonomy shared by every command.
pub mod error;
/// HTTP access to the remote ratings and licensing services.
#[cfg(feature = "retrieve")]
pub mod retrieve;

pub use crate::configs::config_gateway::GatewaySettings;
pub use crate::core::router::{Router, RouterBuilder};
pub use crate::error::GatewayError;

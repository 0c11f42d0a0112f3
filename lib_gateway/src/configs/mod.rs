//! # Configuration Modules
//!
//! Settings that shape a router: authentication, session TTL, whitelist,
//! event-threshold tuning and remote service endpoints.

/// Gateway settings loaded from JSON and overridden from the environment.
pub mod config_gateway;

pub use config_gateway::{ConfigError, GatewaySettings, RemoteSettings, ThresholdSettings};

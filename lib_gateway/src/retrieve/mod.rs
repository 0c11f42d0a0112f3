//! # Remote Retrieval
//!
//! HTTP access to the services the administrative commands reach out to.
//!
//! - **`api_client`**: a JSON `ApiClient` on `reqwest` + `reqwest-middleware`
//!   with exponential-backoff retries and per-client timeouts.
//! - **`catalog`**: [`HttpCatalog`], the [`RemoteCatalog`](crate::backend::RemoteCatalog)
//!   backed by the ratings and licensing endpoints.

#![warn(missing_docs)]

/// Generic JSON client with retry middleware.
pub mod api_client;
/// The ratings and licensing endpoints.
pub mod catalog;

pub use api_client::{ApiClient, ApiResponse, Credentials};
pub use catalog::HttpCatalog;

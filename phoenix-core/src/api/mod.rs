//! HTTP API for the Phoenix control plane.
//!
//! Operators drive experiments and pipeline templates through
//! `/api/v1/*`; host agents long-poll and report through `/agent/*`;
//! both surfaces can be watched live over `/ws`.
//!
//! # Example
//!
//! ```rust,ignore
//! use phoenix_core::api::{ApiConfig, ApiServer};
//!
//! let server = ApiServer::new(ApiConfig::default());
//! server.run().await?;
//! ```

pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod types;

pub use server::{ApiConfig, ApiServer};
pub use state::AppState;
pub use types::*;

//! # Foliopulse Gateway
//!
//! HTTP surface over the fan-out engine: the cron trigger endpoint,
//! investor-scoped schedule administration, and run history. JSON in,
//! JSON out, with an `ok` flag on every response body.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};

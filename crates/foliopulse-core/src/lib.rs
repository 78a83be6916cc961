//! # Foliopulse Core
//!
//! Shared foundation for the Foliopulse service: configuration loading,
//! the crate-wide error type, and the domain model (schedules, templates,
//! metric definitions/requests, reminders, run records).
//!
//! This crate is deliberately free of I/O beyond the config file — the
//! store, engine, notify, and gateway crates build on top of it.

pub mod config;
pub mod error;
pub mod model;

pub use config::FolioConfig;
pub use error::{FolioError, Result};

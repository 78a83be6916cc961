//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced across the Foliopulse crates.
#[derive(Debug, Error)]
pub enum FolioError {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FolioError {
    pub fn store(e: impl std::fmt::Display) -> Self {
        Self::Store(e.to_string())
    }

    pub fn mail(e: impl std::fmt::Display) -> Self {
        Self::Mail(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FolioError>;

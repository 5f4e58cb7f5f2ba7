//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("quota exceeded for {owner}: requested {requested} bytes, {available} available")]
    QuotaExceeded {
        owner: String,
        requested: u64,
        available: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

impl From<ferry_core::Error> for MetadataError {
    fn from(e: ferry_core::Error) -> Self {
        MetadataError::Corrupt(e.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

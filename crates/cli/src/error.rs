//! Client error types.

use ferry_core::upload::ErrorDetails;

/// Errors surfaced by the upload client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Structured error returned by the server.
    #[error("server error {status} ({code}): {message}")]
    Api {
        code: String,
        status: u16,
        message: String,
        details: Option<ErrorDetails>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Another `start` or `resume` is still running on this uploader.
    #[error("an upload is already in progress")]
    Busy,

    #[error(transparent)]
    Core(#[from] ferry_core::Error),
}

impl ClientError {
    /// Server error code, when the server produced one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Transport failures and 5xx responses may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Declared and computed hashes differ.
    ///
    /// On a chunk write this means the body was damaged in transit. On
    /// `complete` the flagged chunks are listed in [`Self::mismatched_chunks`].
    pub fn is_chunk_checksum_mismatch(&self) -> bool {
        self.code() == Some("checksum_mismatch")
    }

    /// Chunk indices the server flagged as corrupt.
    pub fn mismatched_chunks(&self) -> &[u64] {
        match self {
            Self::Api {
                details: Some(details),
                ..
            } => &details.mismatched_chunks,
            _ => &[],
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

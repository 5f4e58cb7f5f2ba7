//! Core domain types shared by the ferry upload server and client.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content hashes (SHA-256, hex encoded on the wire)
//! - Chunk layout arithmetic for a file split into fixed-size chunks
//! - Upload session identity, state machine and wire messages
//! - Configuration shared by the server binary and its tests

pub mod chunk;
pub mod config;
pub mod error;
pub mod hash;
pub mod upload;

pub use chunk::ChunkLayout;
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use upload::{OwnerId, UploadId, UploadSession, UploadState};

/// Default chunk size: 8 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum chunk size: 1 byte. Deployments usually raise this.
pub const MIN_CHUNK_SIZE: u64 = 1;

/// Upper bound on chunks in one session.
pub const MAX_CHUNKS_PER_SESSION: u64 = 100_000;

/// Maximum file name length in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

//! Chunk storage abstraction and backends for ferry.
//!
//! This crate provides:
//! - The [`ChunkStore`] trait: positional writes, streamed reads, listing
//! - Backends: local filesystem and in-memory

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ChunkStore, ChunkStoreExt, EntryStream, ObjectEntry, ObjectMeta};

use ferry_core::config::StorageConfig;
use std::sync::Arc;

/// Create a chunk store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ChunkStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path, .. } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}

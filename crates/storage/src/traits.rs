//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of listed objects.
pub type EntryStream = Pin<Box<dyn Stream<Item = StorageResult<ObjectEntry>> + Send>>;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// An object returned by a listing.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    /// Key relative to the store root.
    pub key: String,
    pub meta: ObjectMeta,
}

/// Storage for partially uploaded files.
///
/// Each key holds one file that is assembled from positional writes. Writes
/// to distinct, non-overlapping ranges of the same key may run concurrently.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Write `data` at byte `offset`, creating the object if needed.
    ///
    /// Bytes outside the written range are left untouched. The write is
    /// durable when this returns.
    async fn write_at(&self, key: &str, offset: u64, data: Bytes) -> StorageResult<()>;

    /// Read the whole object as a byte stream.
    async fn read_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Delete an object. Fails with `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size and modification time without reading it.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// List objects under a prefix as a stream.
    ///
    /// An error from the stream means the enumeration is incomplete.
    async fn list_stream(&self, prefix: &str) -> StorageResult<EntryStream>;

    /// Get the name of this storage backend.
    ///
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup and by the health endpoint.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Convenience helpers provided for every [`ChunkStore`].
///
/// DO NOT IMPLEMENT THIS TRAIT MANUALLY. It is provided via a blanket
/// implementation.
#[async_trait]
pub trait ChunkStoreExt: ChunkStore {
    /// Read the whole object into memory.
    async fn read_all(&self, key: &str) -> StorageResult<Bytes> {
        let mut stream = self.read_stream(key).await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Delete an object, treating a missing object as already deleted.
    ///
    /// Returns `true` if something was removed.
    async fn delete_if_exists(&self, key: &str) -> StorageResult<bool> {
        match self.delete(key).await {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List objects under a prefix into a vector.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectEntry>> {
        self.list_stream(prefix).await?.try_collect().await
    }
}

impl<T: ChunkStore + ?Sized> ChunkStoreExt for T {}

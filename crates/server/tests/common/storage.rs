//! Chunk store wrappers for fault injection.

use async_trait::async_trait;
use bytes::Bytes;
use ferry_storage::{
    ByteStream, ChunkStore, EntryStream, ObjectMeta, StorageError, StorageResult,
};
use std::sync::Arc;

/// Delegates to an inner store but cannot enumerate.
#[allow(dead_code)]
pub struct UnlistableStore {
    inner: Arc<dyn ChunkStore>,
}

#[allow(dead_code)]
impl UnlistableStore {
    pub fn new(inner: Arc<dyn ChunkStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ChunkStore for UnlistableStore {
    async fn write_at(&self, key: &str, offset: u64, data: Bytes) -> StorageResult<()> {
        self.inner.write_at(key, offset, data).await
    }

    async fn read_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.read_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn list_stream(&self, _prefix: &str) -> StorageResult<EntryStream> {
        Err(StorageError::Io(std::io::Error::other("listing unavailable")))
    }

    fn backend_name(&self) -> &'static str {
        "unlistable"
    }
}

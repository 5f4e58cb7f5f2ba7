//! In-memory storage backend.
//!
//! Used by tests and embedded setups. Modification times can be overridden
//! to simulate aged objects.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ChunkStore, EntryStream, ObjectEntry, ObjectMeta};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;

struct MemoryObject {
    data: Vec<u8>,
    modified: OffsetDateTime,
}

/// In-memory chunk store.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the modification time of an object.
    pub async fn set_modified(&self, key: &str, modified: OffsetDateTime) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.modified = modified;
        Ok(())
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|p| p == ".." || p == ".") {
        return Err(StorageError::InvalidKey(format!(
            "key must be a non-empty relative path: {key:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl ChunkStore for MemoryBackend {
    async fn write_at(&self, key: &str, offset: u64, data: Bytes) -> StorageResult<()> {
        validate_key(key)?;
        let start = usize::try_from(offset)
            .map_err(|_| StorageError::InvalidRange(format!("offset {offset} too large")))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| StorageError::InvalidRange(format!("offset {offset} overflows")))?;

        let mut objects = self.objects.write().await;
        let object = objects.entry(key.to_string()).or_insert_with(|| MemoryObject {
            data: Vec::new(),
            modified: OffsetDateTime::now_utc(),
        });
        if object.data.len() < end {
            object.data.resize(end, 0);
        }
        object.data[start..end].copy_from_slice(&data);
        object.modified = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn read_stream(&self, key: &str) -> StorageResult<ByteStream> {
        validate_key(key)?;
        let data = {
            let objects = self.objects.read().await;
            let object = objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            Bytes::copy_from_slice(&object.data)
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        validate_key(key)?;
        let objects = self.objects.read().await;
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: Some(object.modified),
        })
    }

    async fn list_stream(&self, prefix: &str) -> StorageResult<EntryStream> {
        let dir_prefix = format!("{}/", prefix.trim_end_matches('/'));
        let entries: Vec<StorageResult<ObjectEntry>> = self
            .objects
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(&dir_prefix))
            .map(|(key, object)| {
                Ok(ObjectEntry {
                    key: key.clone(),
                    meta: ObjectMeta {
                        size: object.data.len() as u64,
                        last_modified: Some(object.modified),
                    },
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(entries)))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

//! Resource file references.

use crate::error::MetadataResult;
use crate::models::ResourceFileRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for stored files referenced by downstream resources.
#[async_trait]
pub trait ResourceRepo: Send + Sync {
    /// Register a completed upload's file.
    ///
    /// Idempotent per upload: a second registration for the same upload
    /// returns the existing row.
    async fn register_file(&self, file: &ResourceFileRow) -> MetadataResult<ResourceFileRow>;

    /// Get the file registered for an upload.
    async fn get_file_by_upload(&self, upload_id: Uuid) -> MetadataResult<Option<ResourceFileRow>>;

    /// Link a file to a resource.
    async fn link_resource(&self, file_id: Uuid, resource_id: &str) -> MetadataResult<()>;

    /// Sever the link between a file and its resource.
    async fn unlink_resource(&self, file_id: Uuid) -> MetadataResult<bool>;

    /// Files with no resource whose owning session is gone or terminal.
    ///
    /// Includes files detached by an earlier run whose bytes are still present.
    async fn get_detached_files(&self, limit: u32) -> MetadataResult<Vec<ResourceFileRow>>;

    /// Clear the session link and stamp `detached_at`.
    async fn detach_file(&self, file_id: Uuid, detached_at: OffsetDateTime)
    -> MetadataResult<bool>;

    /// Remove the reference row.
    async fn delete_file(&self, file_id: Uuid) -> MetadataResult<()>;

    /// Whether any reference points at `storage_key`.
    async fn file_holds_key(&self, storage_key: &str) -> MetadataResult<bool>;
}

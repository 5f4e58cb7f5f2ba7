//! Hand-off of completed uploads to resource registration.

use crate::error::ApiResult;
use async_trait::async_trait;
use ferry_core::UploadSession;
use ferry_metadata::MetadataStore;
use ferry_metadata::models::ResourceFileRow;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Receives the storage key of every completed session.
///
/// Called again when a concurrent `complete` loses the state transition, so
/// implementations must be idempotent per session.
#[async_trait]
pub trait ResourceRegistrar: Send + Sync {
    async fn register(&self, session: &UploadSession) -> ApiResult<()>;
}

/// Records a resource file reference linked to the upload itself.
pub struct MetadataRegistrar {
    metadata: Arc<dyn MetadataStore>,
}

impl MetadataRegistrar {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl ResourceRegistrar for MetadataRegistrar {
    async fn register(&self, session: &UploadSession) -> ApiResult<()> {
        let row = ResourceFileRow {
            file_id: Uuid::new_v4(),
            storage_key: session.storage_key.clone(),
            upload_id: Some(*session.id.as_uuid()),
            owner_id: session.owner.as_str().to_string(),
            resource_id: Some(session.id.to_string()),
            size_bytes: i64::try_from(session.total_size).unwrap_or(i64::MAX),
            file_sha256: session.file_sha256.to_hex(),
            created_at: OffsetDateTime::now_utc(),
            detached_at: None,
        };
        let stored = self.metadata.register_file(&row).await?;
        tracing::debug!(
            upload_id = %session.id,
            file_id = %stored.file_id,
            storage_key = %stored.storage_key,
            "registered resource file"
        );
        Ok(())
    }
}

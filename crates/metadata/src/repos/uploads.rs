//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{ChunkMark, UploadChunkRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload session operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create a new upload session.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Sessions owned by `owner_id` in `state`, oldest first.
    async fn list_sessions_by_owner(
        &self,
        owner_id: &str,
        state: &str,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Record a received chunk and refresh the session deadline.
    ///
    /// Runs in one transaction and only while the session is `uploading`.
    /// A repeated index leaves the accepted set unchanged.
    async fn mark_chunk_received(
        &self,
        chunk: &UploadChunkRow,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<ChunkMark>;

    /// Get one accepted chunk.
    async fn get_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: i64,
    ) -> MetadataResult<Option<UploadChunkRow>>;

    /// Accepted chunks ordered by index.
    async fn get_received_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>>;

    /// Number of accepted chunks.
    async fn count_received_chunks(&self, upload_id: Uuid) -> MetadataResult<u64>;

    /// Forget accepted chunks whose bytes failed verification.
    ///
    /// Only applies while the session is `uploading`.
    async fn remove_chunks(&self, upload_id: Uuid, chunk_indices: &[i64]) -> MetadataResult<u64>;

    /// Conditionally move a session from `from` to `to`.
    ///
    /// Returns `true` only for the caller whose update changed the row, so
    /// concurrent callers get exactly one winner.
    async fn transition_state(
        &self,
        upload_id: Uuid,
        from: &str,
        to: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Sessions still `uploading` whose deadline is before `now`.
    async fn get_expired_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Terminal sessions last updated before `cutoff`.
    async fn get_terminal_sessions_before(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Delete a session and its chunk rows.
    async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<()>;

    /// Whether an `uploading` session writes to `storage_key`.
    async fn live_session_holds_key(&self, storage_key: &str) -> MetadataResult<bool>;

    /// Count sessions in the `uploading` state.
    async fn count_active_uploads(&self) -> MetadataResult<u64>;
}

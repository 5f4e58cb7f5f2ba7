//! Server side coordination of resumable uploads.
//!
//! The coordinator owns the session state machine:
//!
//! ```text
//! uploading --complete--> completed
//! uploading --abort-----> aborted
//! uploading --ttl-------> expired
//! ```
//!
//! Terminal states are final. Every transition out of `uploading` goes
//! through a conditional update so exactly one caller wins it, and only the
//! winner releases quota or deletes bytes.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::registrar::ResourceRegistrar;
use bytes::Bytes;
use ferry_core::config::{AppConfig, ServerConfig};
use ferry_core::upload::{
    AbortUploadResponse, CompleteUploadResponse, ErrorDetails, InitUploadRequest,
    InitUploadResponse, OngoingUploadsResponse, QuotaUsageResponse, UploadStatusResponse,
    UploadSummary, WriteChunkResponse, validate_file_name,
};
use ferry_core::{ContentHash, ContentHasher, OwnerId, UploadId, UploadSession, UploadState};
use ferry_metadata::MetadataStore;
use ferry_metadata::models::{ChunkMark, UploadChunkRow, UploadSessionRow};
use ferry_metadata::repos::QuotaLedger;
use ferry_storage::{ChunkStore, ChunkStoreExt};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Outcome of moving a session out of `uploading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Another caller moved the session first. Nothing was released.
    Lost,
    /// This call moved the session and released its quota.
    /// `bytes_deleted` is the size of the stored file, if one was removed.
    Won { bytes_deleted: Option<u64> },
}

/// Result of re-reading an assembled file.
struct Verification {
    actual: ContentHash,
    mismatched: Vec<u64>,
}

/// Coordinates upload sessions across the metadata store, quota ledger,
/// chunk store and resource registration.
pub struct UploadCoordinator {
    server: ServerConfig,
    key_prefix: String,
    metadata: Arc<dyn MetadataStore>,
    quota: Arc<dyn QuotaLedger>,
    storage: Arc<dyn ChunkStore>,
    registrar: Arc<dyn ResourceRegistrar>,
}

impl UploadCoordinator {
    /// Create a coordinator. The metadata store doubles as the quota ledger.
    pub fn new(
        config: &AppConfig,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ChunkStore>,
        registrar: Arc<dyn ResourceRegistrar>,
    ) -> Self {
        let quota: Arc<dyn QuotaLedger> = metadata.clone();
        Self {
            server: config.server.clone(),
            key_prefix: config.storage.key_prefix().to_string(),
            metadata,
            quota,
            storage,
            registrar,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn ChunkStore> {
        &self.storage
    }

    pub fn quota(&self) -> &Arc<dyn QuotaLedger> {
        &self.quota
    }

    /// Prefix under which every session's bytes live.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Pick the chunk size for a new session.
    ///
    /// The requested (or default) size is clamped to the configured bounds
    /// and then raised if the file would need more than
    /// `max_chunks_per_session` chunks.
    pub fn negotiate_chunk_size(&self, total_size: u64, requested: Option<u64>) -> ApiResult<u64> {
        let cfg = &self.server;
        let mut chunk_size = requested
            .unwrap_or(cfg.default_chunk_size)
            .clamp(cfg.min_chunk_size, cfg.max_chunk_size);

        if total_size.div_ceil(chunk_size) > cfg.max_chunks_per_session {
            chunk_size = total_size.div_ceil(cfg.max_chunks_per_session);
            if chunk_size > cfg.max_chunk_size {
                return Err(ApiError::Validation(format!(
                    "file of {total_size} bytes needs more than {} chunks of at most {} bytes",
                    cfg.max_chunks_per_session, cfg.max_chunk_size
                )));
            }
        }
        Ok(chunk_size)
    }

    /// Create a new session and reserve quota for it.
    #[instrument(skip(self, request), fields(owner = %owner, total_size = request.total_size))]
    pub async fn init(
        &self,
        owner: &OwnerId,
        request: InitUploadRequest,
    ) -> ApiResult<InitUploadResponse> {
        validate_file_name(&request.file_name)?;
        if request.total_size == 0 {
            return Err(ApiError::Validation(
                "total_size must be greater than zero".to_string(),
            ));
        }
        if self.server.max_file_size > 0 && request.total_size > self.server.max_file_size {
            return Err(ApiError::Validation(format!(
                "total_size {} exceeds the maximum of {} bytes",
                request.total_size, self.server.max_file_size
            )));
        }
        let file_sha256 = ContentHash::from_hex(&request.file_sha256)?;
        let chunk_size = self.negotiate_chunk_size(request.total_size, request.chunk_size)?;

        let session = UploadSession::new(
            owner.clone(),
            request.file_name,
            request.total_size,
            file_sha256,
            chunk_size,
            &self.key_prefix,
            self.server.upload_timeout(),
        );
        let row = UploadSessionRow::from_session(&session)?;

        self.quota
            .reserve(owner.as_str(), session.total_size, *session.id.as_uuid())
            .await?;

        if let Err(e) = self.metadata.create_session(&row).await {
            if let Err(release_err) = self.quota.release(*session.id.as_uuid()).await {
                tracing::warn!(
                    upload_id = %session.id,
                    error = %release_err,
                    "failed to release quota after session creation failed"
                );
            }
            return Err(e.into());
        }

        metrics::UPLOADS_INITIATED.inc();
        tracing::info!(
            upload_id = %session.id,
            chunk_size,
            total_chunks = session.total_chunks(),
            "upload session created"
        );

        Ok(InitUploadResponse {
            upload_id: session.id,
            chunk_size,
            total_chunks: session.total_chunks(),
            expires_at: session.expires_at,
        })
    }

    /// Verify and store one chunk.
    #[instrument(skip(self, chunk_sha256, data), fields(owner = %owner, upload_id = %upload_id))]
    pub async fn write_chunk(
        &self,
        owner: &OwnerId,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &str,
        data: Bytes,
        declared_len: u64,
    ) -> ApiResult<WriteChunkResponse> {
        let session = self.load_owned(owner, upload_id).await?;
        self.ensure_live(&session).await?;

        let layout = session.layout();
        let expected_len = layout.chunk_len(chunk_index)?;
        if declared_len != expected_len || data.len() as u64 != declared_len {
            return Err(ApiError::Validation(format!(
                "chunk {chunk_index} must be {expected_len} bytes, declared {declared_len}, received {}",
                data.len()
            )));
        }

        let declared = ContentHash::from_hex(chunk_sha256)?;
        let actual = ContentHash::compute(&data);
        if actual != declared {
            metrics::CHUNK_CHECKSUM_FAILURES.inc();
            return Err(ApiError::ChecksumMismatch {
                message: format!("chunk {chunk_index} does not match its declared hash"),
                details: ErrorDetails {
                    mismatched_chunks: vec![chunk_index],
                    expected: Some(declared.to_hex()),
                    actual: Some(actual.to_hex()),
                },
            });
        }

        let index = to_i64(chunk_index)?;
        if let Some(existing) = self.metadata.get_chunk(*upload_id.as_uuid(), index).await?
            && existing.chunk_sha256 != declared.to_hex()
        {
            return Err(conflicting_chunk(chunk_index));
        }

        let bytes = data.len() as u64;
        self.storage
            .write_at(&session.storage_key, layout.offset_of(chunk_index), data)
            .await?;

        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.server.upload_timeout();
        let row = UploadChunkRow {
            upload_id: *upload_id.as_uuid(),
            chunk_index: index,
            chunk_sha256: declared.to_hex(),
            size_bytes: to_i64(bytes)?,
            received_at: now,
        };

        let accepted_chunks = match self.metadata.mark_chunk_received(&row, expires_at).await? {
            ChunkMark::Inserted { accepted } => {
                metrics::CHUNKS_RECEIVED.inc();
                metrics::CHUNK_BYTES_RECEIVED.inc_by(bytes);
                accepted
            }
            ChunkMark::Duplicate { accepted } => {
                tracing::debug!(chunk_index, "duplicate chunk accepted as no-op");
                accepted
            }
            ChunkMark::HashConflict { .. } => return Err(conflicting_chunk(chunk_index)),
            ChunkMark::NotLive => {
                // Lost a race with abort, complete or expiry. The bytes just
                // written are left for the orphan scan.
                let current = self.load_owned(owner, upload_id).await?;
                return Err(not_live_error(&current));
            }
        };

        tracing::debug!(chunk_index, bytes, accepted_chunks, "chunk accepted");

        Ok(WriteChunkResponse {
            upload_id,
            chunk_index,
            accepted_chunks,
            expires_at,
        })
    }

    /// Report a session's progress.
    ///
    /// A live session past its deadline is expired first and reported as
    /// such.
    pub async fn status(
        &self,
        owner: &OwnerId,
        upload_id: UploadId,
    ) -> ApiResult<UploadStatusResponse> {
        let mut session = self.load_owned(owner, upload_id).await?;
        if session.state.is_active() && session.is_expired() {
            self.expire(&session).await?;
            session = self.load_owned(owner, upload_id).await?;
        }

        let accepted_chunks = self
            .metadata
            .get_received_chunks(*upload_id.as_uuid())
            .await?
            .iter()
            .map(UploadChunkRow::index)
            .collect();

        Ok(UploadStatusResponse {
            upload_id,
            state: session.state,
            total_chunks: session.total_chunks(),
            file_name: session.file_name,
            total_size: session.total_size,
            file_sha256: session.file_sha256,
            chunk_size: session.chunk_size,
            accepted_chunks,
            expires_at: session.expires_at,
        })
    }

    /// Verify the assembled file and finalize the session.
    ///
    /// Completing an already completed session returns the same response.
    #[instrument(skip(self), fields(owner = %owner, upload_id = %upload_id))]
    pub async fn complete(
        &self,
        owner: &OwnerId,
        upload_id: UploadId,
    ) -> ApiResult<CompleteUploadResponse> {
        let _timer = metrics::COMPLETE_DURATION.start_timer();

        let session = self.load_owned(owner, upload_id).await?;
        if session.state == UploadState::Completed {
            return self.finish_completion(session).await;
        }
        self.ensure_live(&session).await?;

        let chunks = self
            .metadata
            .get_received_chunks(*upload_id.as_uuid())
            .await?;
        let accepted: Vec<u64> = chunks.iter().map(UploadChunkRow::index).collect();
        let missing = session.layout().missing(&accepted);
        if !missing.is_empty() {
            return Err(ApiError::IncompleteUpload { missing });
        }

        let verification = self.verify_assembled(&session, &chunks).await?;
        let details = ErrorDetails {
            mismatched_chunks: verification.mismatched.clone(),
            expected: Some(session.file_sha256.to_hex()),
            actual: Some(verification.actual.to_hex()),
        };

        if !verification.mismatched.is_empty() {
            let indices = verification
                .mismatched
                .iter()
                .map(|&i| to_i64(i))
                .collect::<ApiResult<Vec<_>>>()?;
            self.metadata
                .remove_chunks(*upload_id.as_uuid(), &indices)
                .await?;
            metrics::CHUNK_CHECKSUM_FAILURES.inc();
            tracing::warn!(
                mismatched = ?verification.mismatched,
                "stored chunks failed verification and were dropped from the accepted set"
            );
            return Err(ApiError::ChecksumMismatch {
                message: format!(
                    "{} stored chunks do not match their recorded hashes",
                    verification.mismatched.len()
                ),
                details,
            });
        }

        if verification.actual != session.file_sha256 {
            metrics::CHUNK_CHECKSUM_FAILURES.inc();
            return Err(ApiError::ChecksumMismatch {
                message: "assembled file does not match the declared file hash".to_string(),
                details,
            });
        }

        let won = self
            .metadata
            .transition_state(
                *upload_id.as_uuid(),
                UploadState::Uploading.as_str(),
                UploadState::Completed.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;

        if !won {
            let current = self.load_owned(owner, upload_id).await?;
            if current.state == UploadState::Completed {
                return self.finish_completion(current).await;
            }
            return Err(not_live_error(&current));
        }

        metrics::UPLOADS_COMPLETED.inc();
        tracing::info!(total_size = session.total_size, "upload completed");

        let mut completed = session;
        completed.state = UploadState::Completed;
        self.finish_completion(completed).await
    }

    /// Abort a live session. Aborting a terminal session is a no-op.
    #[instrument(skip(self), fields(owner = %owner, upload_id = %upload_id))]
    pub async fn abort(
        &self,
        owner: &OwnerId,
        upload_id: UploadId,
    ) -> ApiResult<AbortUploadResponse> {
        let session = self.load_owned(owner, upload_id).await?;
        if session.state.is_terminal() {
            return Ok(AbortUploadResponse {
                upload_id,
                state: session.state,
            });
        }

        let state = match self.terminate(&session, UploadState::Aborted).await? {
            Termination::Won { bytes_deleted } => {
                metrics::UPLOADS_ABORTED.inc();
                tracing::info!(bytes_deleted = bytes_deleted.unwrap_or(0), "upload aborted");
                UploadState::Aborted
            }
            Termination::Lost => self.load_owned(owner, upload_id).await?.state,
        };

        Ok(AbortUploadResponse { upload_id, state })
    }

    /// List the owner's live sessions.
    pub async fn list_ongoing(&self, owner: &OwnerId) -> ApiResult<OngoingUploadsResponse> {
        let rows = self
            .metadata
            .list_sessions_by_owner(owner.as_str(), UploadState::Uploading.as_str())
            .await?;

        let mut uploads = Vec::with_capacity(rows.len());
        for row in rows {
            let session = row.into_session()?;
            if session.is_expired() {
                continue;
            }
            let accepted_chunks = self
                .metadata
                .count_received_chunks(*session.id.as_uuid())
                .await?;
            uploads.push(UploadSummary {
                upload_id: session.id,
                total_chunks: session.total_chunks(),
                file_name: session.file_name,
                total_size: session.total_size,
                chunk_size: session.chunk_size,
                accepted_chunks,
                created_at: session.created_at,
                expires_at: session.expires_at,
            });
        }

        Ok(OngoingUploadsResponse { uploads })
    }

    /// Report the owner's quota usage.
    pub async fn quota_usage(&self, owner: &OwnerId) -> ApiResult<QuotaUsageResponse> {
        let usage = self.quota.usage(owner.as_str()).await?;
        Ok(QuotaUsageResponse {
            owner: owner.clone(),
            limit: usage.limit,
            reserved: usage.reserved,
            used: usage.used,
        })
    }

    /// Move a live session to `expired`.
    pub async fn expire(&self, session: &UploadSession) -> ApiResult<Termination> {
        let outcome = self.terminate(session, UploadState::Expired).await?;
        if let Termination::Won { bytes_deleted } = outcome {
            metrics::UPLOADS_EXPIRED.inc();
            tracing::info!(
                upload_id = %session.id,
                bytes_deleted = bytes_deleted.unwrap_or(0),
                "upload session expired"
            );
        }
        Ok(outcome)
    }

    /// Transition a live session to `target`, release its quota and delete
    /// its bytes.
    ///
    /// Byte deletion is best-effort. Leftovers are picked up by the orphan
    /// scan once the grace period has passed.
    pub(crate) async fn terminate(
        &self,
        session: &UploadSession,
        target: UploadState,
    ) -> ApiResult<Termination> {
        let id = *session.id.as_uuid();
        let won = self
            .metadata
            .transition_state(
                id,
                UploadState::Uploading.as_str(),
                target.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !won {
            return Ok(Termination::Lost);
        }

        self.quota.release(id).await?;
        let bytes_deleted = match self.delete_bytes(&session.storage_key).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!(
                    upload_id = %session.id,
                    storage_key = %session.storage_key,
                    error = %e,
                    "failed to delete upload bytes"
                );
                None
            }
        };
        Ok(Termination::Won { bytes_deleted })
    }

    /// Delete a stored file. Returns its size if it existed.
    pub(crate) async fn delete_bytes(&self, storage_key: &str) -> ApiResult<Option<u64>> {
        let size = match self.storage.head(storage_key).await {
            Ok(meta) => meta.size,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.storage.delete_if_exists(storage_key).await? {
            Ok(Some(size))
        } else {
            Ok(None)
        }
    }

    async fn load_owned(&self, owner: &OwnerId, upload_id: UploadId) -> ApiResult<UploadSession> {
        match self.metadata.get_session(*upload_id.as_uuid()).await? {
            // Sessions of other owners are reported as missing.
            Some(row) if row.owner_id == owner.as_str() => Ok(row.into_session()?),
            _ => Err(ApiError::NotFound(format!("upload session {upload_id}"))),
        }
    }

    /// Fail unless the session is `uploading` and within its deadline.
    async fn ensure_live(&self, session: &UploadSession) -> ApiResult<()> {
        if !session.state.is_active() {
            return Err(not_live_error(session));
        }
        if session.is_expired() {
            self.expire(session).await?;
            return Err(ApiError::Expired(format!("upload session {}", session.id)));
        }
        Ok(())
    }

    async fn finish_completion(&self, session: UploadSession) -> ApiResult<CompleteUploadResponse> {
        self.quota.finalize(*session.id.as_uuid()).await?;
        self.registrar.register(&session).await?;
        Ok(CompleteUploadResponse {
            upload_id: session.id,
            state: session.state,
            file_sha256: session.file_sha256,
            total_size: session.total_size,
            storage_key: session.storage_key,
        })
    }

    /// Stream the assembled file once, hashing it whole and per chunk.
    async fn verify_assembled(
        &self,
        session: &UploadSession,
        chunks: &[UploadChunkRow],
    ) -> ApiResult<Verification> {
        let layout = session.layout();
        let total_chunks = layout.total_chunks();
        let recorded: HashMap<u64, &str> = chunks
            .iter()
            .map(|c| (c.index(), c.chunk_sha256.as_str()))
            .collect();

        let mut stream = self.storage.read_stream(&session.storage_key).await?;
        let mut whole = ContentHasher::new();
        let mut piece = ContentHasher::new();
        let mut computed: Vec<ContentHash> = Vec::with_capacity(total_chunks as usize);
        let mut index = 0u64;
        let mut remaining = layout.chunk_len(0)?;

        while let Some(buf) = stream.try_next().await? {
            let mut buf = &buf[..];
            while !buf.is_empty() && index < total_chunks {
                let take = remaining.min(buf.len() as u64) as usize;
                whole.update(&buf[..take]);
                piece.update(&buf[..take]);
                buf = &buf[take..];
                remaining -= take as u64;
                if remaining == 0 {
                    computed.push(std::mem::take(&mut piece).finalize());
                    index += 1;
                    if index < total_chunks {
                        remaining = layout.chunk_len(index)?;
                    }
                }
            }
        }

        // A short file leaves trailing indices without a computed hash.
        let mismatched = (0..total_chunks)
            .filter(|i| {
                let actual = computed.get(*i as usize).map(ContentHash::to_hex);
                actual.as_deref() != recorded.get(i).copied()
            })
            .collect();

        Ok(Verification {
            actual: whole.finalize(),
            mismatched,
        })
    }
}

fn to_i64(value: u64) -> ApiResult<i64> {
    i64::try_from(value).map_err(|_| ApiError::Validation(format!("{value} is out of range")))
}

fn conflicting_chunk(chunk_index: u64) -> ApiError {
    ApiError::Conflict(format!(
        "chunk {chunk_index} was already accepted with a different hash"
    ))
}

fn not_live_error(session: &UploadSession) -> ApiError {
    match session.state {
        UploadState::Expired => ApiError::Expired(format!("upload session {}", session.id)),
        state => ApiError::Conflict(format!("upload session {} is {state}", session.id)),
    }
}

//! Upload session types, lifecycle and wire messages.

use crate::chunk::ChunkLayout;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::UploadSession(format!("invalid upload ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the user that owns a session and its quota.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload session state.
///
/// `Uploading` is the only live state. The other three are terminal and no
/// transition leaves them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Session is open and accepting chunks.
    Uploading,
    /// All chunks arrived and the file hash verified.
    Completed,
    /// Session outlived its TTL.
    Expired,
    /// Session was explicitly aborted by its owner.
    Aborted,
}

impl UploadState {
    /// Check if the session is still active (can receive chunks).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            "aborted" => Ok(Self::Aborted),
            other => Err(crate::Error::UploadSession(format!(
                "unknown upload state: {other}"
            ))),
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upload session tracking resumable upload state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: UploadId,
    /// Owner of the session and its quota reservation.
    pub owner: OwnerId,
    /// Client supplied file name (display only).
    pub file_name: String,
    /// Declared file size in bytes. Immutable once set.
    pub total_size: u64,
    /// Expected SHA-256 of the whole file.
    pub file_sha256: ContentHash,
    /// Negotiated chunk size.
    pub chunk_size: u64,
    /// Chunk store key the bytes are written to. Unique per session.
    pub storage_key: String,
    /// Current session state.
    pub state: UploadState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Deadline for the next chunk write. Refreshed on every accepted chunk.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new session in the `Uploading` state.
    ///
    /// The storage key is `{key_prefix}/{id}`, so it is unique per session.
    pub fn new(
        owner: OwnerId,
        file_name: String,
        total_size: u64,
        file_sha256: ContentHash,
        chunk_size: u64,
        key_prefix: &str,
        ttl: time::Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let id = UploadId::new();
        let storage_key = format!("{}/{id}", key_prefix.trim_end_matches('/'));
        Self {
            id,
            owner,
            file_name,
            total_size,
            file_sha256,
            chunk_size,
            storage_key,
            state: UploadState::Uploading,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if the session's deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Chunk layout for this session.
    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
        }
    }

    /// Calculate the expected number of chunks.
    pub fn total_chunks(&self) -> u64 {
        self.layout().total_chunks()
    }
}

/// Validate a client supplied file name.
pub fn validate_file_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidFileName("empty".to_string()));
    }
    if name.len() > crate::MAX_FILE_NAME_LEN {
        return Err(crate::Error::InvalidFileName(format!(
            "longer than {} bytes",
            crate::MAX_FILE_NAME_LEN
        )));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(crate::Error::InvalidFileName(format!(
            "{name:?} contains path components"
        )));
    }
    Ok(())
}

/// Request to create an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadRequest {
    /// Display name of the file being uploaded.
    pub file_name: String,
    /// File size in bytes.
    pub total_size: u64,
    /// Expected SHA-256 of the whole file, hex encoded.
    pub file_sha256: String,
    /// Requested chunk size (optional, server default if not specified).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Response from creating an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub upload_id: UploadId,
    /// Negotiated chunk size. May differ from the requested one.
    pub chunk_size: u64,
    pub total_chunks: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Response from writing one chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteChunkResponse {
    pub upload_id: UploadId,
    pub chunk_index: u64,
    /// Number of distinct chunk indices accepted so far.
    pub accepted_chunks: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Response from querying upload status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub upload_id: UploadId,
    pub state: UploadState,
    pub file_name: String,
    pub total_size: u64,
    pub file_sha256: ContentHash,
    pub chunk_size: u64,
    pub total_chunks: u64,
    /// Accepted chunk indices in ascending order.
    pub accepted_chunks: Vec<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl UploadStatusResponse {
    /// Indices the server has not accepted yet.
    pub fn missing_chunks(&self) -> Vec<u64> {
        ChunkLayout {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
        }
        .missing(&self.accepted_chunks)
    }
}

/// Response from completing an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub upload_id: UploadId,
    pub state: UploadState,
    pub file_sha256: ContentHash,
    pub total_size: u64,
    /// Chunk store key handed to resource registration.
    pub storage_key: String,
}

/// Response from aborting an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortUploadResponse {
    pub upload_id: UploadId,
    /// State after the call. Already-terminal sessions report their existing state.
    pub state: UploadState,
}

/// Summary of a live session for listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSummary {
    pub upload_id: UploadId,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub accepted_chunks: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Response listing the caller's live sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OngoingUploadsResponse {
    pub uploads: Vec<UploadSummary>,
}

/// Quota usage for an owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsageResponse {
    pub owner: OwnerId,
    pub limit: u64,
    pub reserved: u64,
    pub used: u64,
}

/// Error body returned by the server for every failed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine readable error code.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Structured details attached to some errors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Chunk indices whose stored bytes did not match their recorded hash.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatched_chunks: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

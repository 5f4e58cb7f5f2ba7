//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use ferry_core::{ContentHash, OwnerId, UploadId, UploadSession, UploadState};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

fn to_u64(field: &str, value: i64) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("negative {field}: {value}")))
}

pub(crate) fn to_i64(field: &str, value: u64) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("{field} {value} exceeds i64 range")))
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub owner_id: String,
    pub file_name: String,
    pub total_size: i64,
    pub file_sha256: String,
    pub chunk_size: i64,
    pub storage_key: String,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl UploadSessionRow {
    pub fn from_session(session: &UploadSession) -> MetadataResult<Self> {
        Ok(Self {
            upload_id: *session.id.as_uuid(),
            owner_id: session.owner.as_str().to_string(),
            file_name: session.file_name.clone(),
            total_size: to_i64("total_size", session.total_size)?,
            file_sha256: session.file_sha256.to_hex(),
            chunk_size: to_i64("chunk_size", session.chunk_size)?,
            storage_key: session.storage_key.clone(),
            state: session.state.as_str().to_string(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
        })
    }

    pub fn into_session(self) -> MetadataResult<UploadSession> {
        Ok(UploadSession {
            id: UploadId::from_uuid(self.upload_id),
            owner: OwnerId::new(self.owner_id),
            file_name: self.file_name,
            total_size: to_u64("total_size", self.total_size)?,
            file_sha256: ContentHash::from_hex(&self.file_sha256)?,
            chunk_size: to_u64("chunk_size", self.chunk_size)?,
            storage_key: self.storage_key,
            state: UploadState::parse(&self.state)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}

/// An accepted chunk of an upload.
#[derive(Debug, Clone, FromRow)]
pub struct UploadChunkRow {
    pub upload_id: Uuid,
    pub chunk_index: i64,
    pub chunk_sha256: String,
    pub size_bytes: i64,
    pub received_at: OffsetDateTime,
}

impl UploadChunkRow {
    pub fn index(&self) -> u64 {
        self.chunk_index.max(0) as u64
    }
}

/// Outcome of recording a received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkMark {
    /// First acceptance of this index.
    Inserted { accepted: u64 },
    /// Index was already accepted with the same hash.
    Duplicate { accepted: u64 },
    /// Index was already accepted with a different hash. Nothing changed.
    HashConflict { existing_sha256: String },
    /// Session is missing or no longer `uploading`. Nothing changed.
    NotLive,
}

// =============================================================================
// Quota ledger
// =============================================================================

/// Quota reservation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Reserved,
    Used,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Used => "used",
            Self::Released => "released",
        }
    }
}

/// A per-owner quota delta keyed by upload session.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaReservationRow {
    pub reservation_key: Uuid,
    pub owner_id: String,
    pub amount: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Aggregated quota figures for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub limit: u64,
    pub reserved: u64,
    pub used: u64,
}

impl QuotaUsage {
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.reserved + self.used)
    }
}

// =============================================================================
// Resource file references
// =============================================================================

/// A stored file handed to resource registration.
///
/// `upload_id` is cleared once the reference is detached. `resource_id` is
/// cleared by the resource owner when the resource no longer uses the file.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceFileRow {
    pub file_id: Uuid,
    pub storage_key: String,
    pub upload_id: Option<Uuid>,
    pub owner_id: String,
    pub resource_id: Option<String>,
    pub size_bytes: i64,
    pub file_sha256: String,
    pub created_at: OffsetDateTime,
    pub detached_at: Option<OffsetDateTime>,
}

// =============================================================================
// Reaper runs
// =============================================================================

/// Record of one cleanup reaper run.
#[derive(Debug, Clone, FromRow)]
pub struct ReaperRunRow {
    pub run_id: Uuid,
    pub state: String,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_row_roundtrip() {
        let session = UploadSession::new(
            OwnerId::new("alice"),
            "a.bin".to_string(),
            9,
            ContentHash::compute(b"123456789"),
            4,
            "uploads/a",
            time::Duration::minutes(30),
        );
        let row = UploadSessionRow::from_session(&session).unwrap();
        assert_eq!(row.state, "uploading");
        assert_eq!(row.into_session().unwrap(), session);
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let session = UploadSession::new(
            OwnerId::new("alice"),
            "a.bin".to_string(),
            1,
            ContentHash::compute(b"x"),
            1,
            "uploads/b",
            time::Duration::minutes(30),
        );
        let mut row = UploadSessionRow::from_session(&session).unwrap();
        row.state = "committing".to_string();
        assert!(matches!(row.into_session(), Err(MetadataError::Corrupt(_))));
    }

    #[test]
    fn test_quota_available_saturates() {
        let usage = QuotaUsage {
            limit: 10,
            reserved: 8,
            used: 5,
        };
        assert_eq!(usage.available(), 0);
    }
}

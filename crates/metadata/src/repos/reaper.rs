//! Cleanup reaper run records.

use crate::error::MetadataResult;
use crate::models::ReaperRunRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for reaper run bookkeeping.
#[async_trait]
pub trait ReaperRunRepo: Send + Sync {
    /// Record a new run.
    async fn create_reaper_run(&self, run: &ReaperRunRow) -> MetadataResult<()>;

    /// Get a run by ID.
    async fn get_reaper_run(&self, run_id: Uuid) -> MetadataResult<Option<ReaperRunRow>>;

    /// Update a run's state and stats.
    async fn update_reaper_run(
        &self,
        run_id: Uuid,
        state: &str,
        finished_at: Option<OffsetDateTime>,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Most recent runs first.
    async fn get_recent_reaper_runs(&self, limit: u32) -> MetadataResult<Vec<ReaperRunRow>>;

    /// Mark runs left `running` by a previous process as `failed`.
    ///
    /// Returns the number of runs recovered.
    async fn fail_orphaned_reaper_runs(&self, finished_at: OffsetDateTime) -> MetadataResult<u64>;
}

/// Reaper run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperRunState {
    Running,
    Finished,
    Failed,
}

impl ReaperRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// Reaper run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReaperStats {
    /// Uploading sessions moved to expired.
    pub sessions_expired: u64,
    /// Terminal session records deleted after retention.
    pub sessions_purged: u64,
    /// Resource file references detached.
    pub files_detached: u64,
    /// Stored files deleted for expired, purged or detached records.
    pub files_deleted: u64,
    /// Unclaimed files deleted by the orphan scan.
    pub orphans_deleted: u64,
    /// Bytes reclaimed across all phases.
    pub bytes_reclaimed: u64,
    /// Per-item failures that were logged and skipped.
    pub errors: u64,
    /// The orphan scan could not enumerate the store.
    #[serde(default)]
    pub orphan_scan_aborted: bool,
}

//! Cleanup reaper.
//!
//! Each run works through four phases:
//! 1. expire live sessions past their deadline
//! 2. purge terminal session records past the retention window
//! 3. detach and delete resource files that lost their resource link
//! 4. delete unclaimed files in the chunk store older than the grace period
//!
//! Per-item failures are logged and counted, never fatal to the run. A
//! failure to enumerate the chunk store only ends phase 4.

use crate::coordinator::{Termination, UploadCoordinator};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use ferry_core::UploadState;
use ferry_core::config::ReaperConfig;
use ferry_metadata::models::ReaperRunRow;
use ferry_metadata::repos::{ReaperRunState, ReaperStats};
use futures::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Summary of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct ReaperRunReport {
    pub run_id: Uuid,
    pub state: &'static str,
    pub stats: ReaperStats,
}

/// Periodic cleanup of expired sessions, stale records and orphaned bytes.
pub struct CleanupReaper {
    coordinator: Arc<UploadCoordinator>,
    config: ReaperConfig,
    /// Held for the duration of a run so scheduled and manual runs never overlap.
    running: Mutex<()>,
}

impl CleanupReaper {
    pub fn new(coordinator: Arc<UploadCoordinator>, config: ReaperConfig) -> Self {
        Self {
            coordinator,
            config,
            running: Mutex::new(()),
        }
    }

    /// Mark runs left `running` by a previous process as `failed`.
    pub async fn recover_interrupted_runs(&self) -> ApiResult<u64> {
        let recovered = self
            .coordinator
            .metadata()
            .fail_orphaned_reaper_runs(OffsetDateTime::now_utc())
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "marked interrupted reaper runs as failed");
        }
        Ok(recovered)
    }

    /// Run the scheduled loop until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) => tracing::debug!(
                        run_id = %report.run_id,
                        state = report.state,
                        "scheduled reaper run finished"
                    ),
                    Err(ApiError::Conflict(_)) => {
                        tracing::debug!("reaper run already in progress, skipping tick")
                    }
                    Err(e) => tracing::error!(error = %e, "scheduled reaper run failed"),
                }
            }
        })
    }

    /// Execute one full run and record it.
    ///
    /// Fails with `Conflict` if another run is in progress.
    pub async fn run_once(&self) -> ApiResult<ReaperRunReport> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| ApiError::Conflict("a reaper run is already in progress".to_string()))?;

        let metadata = self.coordinator.metadata();
        let run_id = Uuid::new_v4();
        let started = std::time::Instant::now();
        metadata
            .create_reaper_run(&ReaperRunRow {
                run_id,
                state: ReaperRunState::Running.as_str().to_string(),
                started_at: OffsetDateTime::now_utc(),
                finished_at: None,
                stats_json: None,
            })
            .await?;
        metrics::REAPER_RUNS.inc();

        let mut stats = ReaperStats::default();
        let result = self.sweep(&mut stats).await;

        let state = match &result {
            Ok(()) if stats.errors == 0 => ReaperRunState::Finished,
            Ok(()) => {
                tracing::warn!(
                    run_id = %run_id,
                    errors = stats.errors,
                    "reaper run completed with errors, marking as failed"
                );
                ReaperRunState::Failed
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "reaper run failed");
                ReaperRunState::Failed
            }
        };

        metrics::REAPER_ORPHANS_DELETED.inc_by(stats.orphans_deleted);
        metrics::REAPER_BYTES_RECLAIMED.inc_by(stats.bytes_reclaimed);

        let stats_json = serde_json::to_string(&stats)
            .map_err(|e| {
                tracing::error!(run_id = %run_id, error = %e, "failed to serialize reaper stats");
                e
            })
            .ok();
        metadata
            .update_reaper_run(
                run_id,
                state.as_str(),
                Some(OffsetDateTime::now_utc()),
                stats_json.as_deref(),
            )
            .await?;

        tracing::info!(
            run_id = %run_id,
            state = state.as_str(),
            sessions_expired = stats.sessions_expired,
            sessions_purged = stats.sessions_purged,
            files_deleted = stats.files_deleted,
            orphans_deleted = stats.orphans_deleted,
            bytes_reclaimed = stats.bytes_reclaimed,
            errors = stats.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reaper run finished"
        );

        result?;
        Ok(ReaperRunReport {
            run_id,
            state: state.as_str(),
            stats,
        })
    }

    async fn sweep(&self, stats: &mut ReaperStats) -> ApiResult<()> {
        self.expire_sessions(stats).await?;
        self.purge_terminal_sessions(stats).await?;
        self.delete_detached_files(stats).await?;

        if self.config.orphan_scan_enabled
            && let Err(e) = self.scan_orphans(stats).await
        {
            tracing::warn!(error = %e, "orphan scan aborted");
            stats.orphan_scan_aborted = true;
            stats.errors += 1;
        }

        let active = self.coordinator.metadata().count_active_uploads().await?;
        metrics::ACTIVE_UPLOAD_SESSIONS.set(active as i64);
        Ok(())
    }

    /// Phase 1: live sessions past their deadline.
    async fn expire_sessions(&self, stats: &mut ReaperStats) -> ApiResult<()> {
        let metadata = self.coordinator.metadata();
        for _ in 0..self.config.max_batches {
            let batch = metadata
                .get_expired_sessions(OffsetDateTime::now_utc(), self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for row in batch {
                let upload_id = row.upload_id;
                let session = match row.into_session() {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(
                            upload_id = %upload_id,
                            error = %e,
                            "skipping unreadable session"
                        );
                        stats.errors += 1;
                        continue;
                    }
                };
                match self.coordinator.expire(&session).await {
                    Ok(Termination::Won { bytes_deleted }) => {
                        progressed = true;
                        stats.sessions_expired += 1;
                        if let Some(bytes) = bytes_deleted {
                            stats.files_deleted += 1;
                            stats.bytes_reclaimed += bytes;
                        }
                    }
                    Ok(Termination::Lost) => progressed = true,
                    Err(e) => {
                        tracing::warn!(
                            upload_id = %upload_id,
                            error = %e,
                            "failed to expire session"
                        );
                        stats.errors += 1;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Phase 2: terminal records past retention.
    async fn purge_terminal_sessions(&self, stats: &mut ReaperStats) -> ApiResult<()> {
        let metadata = self.coordinator.metadata();
        let cutoff = OffsetDateTime::now_utc() - self.config.terminal_retention();
        for _ in 0..self.config.max_batches {
            let batch = metadata
                .get_terminal_sessions_before(cutoff, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for row in batch {
                let upload_id = row.upload_id;
                match self
                    .purge_session(row.state.as_str(), upload_id, &row.storage_key, stats)
                    .await
                {
                    Ok(()) => {
                        progressed = true;
                        stats.sessions_purged += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            upload_id = %upload_id,
                            error = %e,
                            "failed to purge session"
                        );
                        stats.errors += 1;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    async fn purge_session(
        &self,
        state: &str,
        upload_id: Uuid,
        storage_key: &str,
        stats: &mut ReaperStats,
    ) -> ApiResult<()> {
        // Completed bytes belong to the resource file reference.
        if state != UploadState::Completed.as_str() {
            // Release is idempotent; this covers a release that failed at
            // termination time.
            self.coordinator.quota().release(upload_id).await?;
            if let Some(bytes) = self.coordinator.delete_bytes(storage_key).await? {
                stats.files_deleted += 1;
                stats.bytes_reclaimed += bytes;
            }
        }
        self.coordinator.metadata().delete_session(upload_id).await?;
        tracing::debug!(upload_id = %upload_id, state, "purged terminal session");
        Ok(())
    }

    /// Phase 3: resource files with no resource and no live session.
    async fn delete_detached_files(&self, stats: &mut ReaperStats) -> ApiResult<()> {
        let metadata = self.coordinator.metadata();
        for _ in 0..self.config.max_batches {
            let batch = metadata.get_detached_files(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for file in batch {
                match self.reclaim_file(file.file_id, &file.storage_key, stats).await {
                    Ok(()) => progressed = true,
                    Err(e) => {
                        // The detached row stays and is retried next run.
                        tracing::warn!(
                            file_id = %file.file_id,
                            storage_key = %file.storage_key,
                            error = %e,
                            "failed to delete detached file"
                        );
                        stats.errors += 1;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    async fn reclaim_file(
        &self,
        file_id: Uuid,
        storage_key: &str,
        stats: &mut ReaperStats,
    ) -> ApiResult<()> {
        let metadata = self.coordinator.metadata();
        if metadata
            .detach_file(file_id, OffsetDateTime::now_utc())
            .await?
        {
            stats.files_detached += 1;
        }
        if let Some(bytes) = self.coordinator.delete_bytes(storage_key).await? {
            stats.files_deleted += 1;
            stats.bytes_reclaimed += bytes;
        }
        metadata.delete_file(file_id).await?;
        Ok(())
    }

    /// Phase 4: files no live session or resource file claims.
    async fn scan_orphans(&self, stats: &mut ReaperStats) -> ApiResult<()> {
        let metadata = self.coordinator.metadata();
        let storage = self.coordinator.storage();
        let cutoff = OffsetDateTime::now_utc() - self.config.orphan_grace_period();

        let mut entries = storage.list_stream(self.coordinator.key_prefix()).await?;
        while let Some(entry) = entries.try_next().await? {
            // Files without a modification time cannot be aged, so they stay.
            let Some(modified) = entry.meta.last_modified else {
                continue;
            };
            if modified > cutoff {
                continue;
            }
            if metadata.live_session_holds_key(&entry.key).await?
                || metadata.file_holds_key(&entry.key).await?
            {
                continue;
            }

            match storage.delete(&entry.key).await {
                Ok(()) => {
                    stats.orphans_deleted += 1;
                    stats.bytes_reclaimed += entry.meta.size;
                    tracing::debug!(
                        key = %entry.key,
                        size = entry.meta.size,
                        "deleted orphaned file"
                    );
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "failed to delete orphaned file");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }
}

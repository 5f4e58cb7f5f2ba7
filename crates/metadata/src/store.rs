//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{QuotaLedger, ReaperRunRepo, ResourceRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UploadRepo + QuotaLedger + ResourceRepo + ReaperRunRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    default_quota_limit: u64,
}

impl SqliteStore {
    /// Open (or create) a SQLite store and run migrations.
    ///
    /// `default_quota_limit` applies to owners without an explicit limit.
    pub async fn new(path: impl AsRef<Path>, default_quota_limit: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One connection serializes writers, which the quota and
            // state-transition transactions rely on.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            default_quota_limit,
        };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "opened sqlite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use time::OffsetDateTime;
    use tracing::instrument;
    use uuid::Uuid;

    const SESSION_COLUMNS: &str = "upload_id, owner_id, file_name, total_size, file_sha256, \
         chunk_size, storage_key, state, created_at, updated_at, expires_at";

    const FILE_COLUMNS: &str = "file_id, storage_key, upload_id, owner_id, resource_id, \
         size_bytes, file_sha256, created_at, detached_at";

    #[async_trait]
    impl UploadRepo for SqliteStore {
        #[instrument(
            skip(self, session),
            fields(upload_id = %session.upload_id, owner = %session.owner_id)
        )]
        async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    upload_id, owner_id, file_name, total_size, file_sha256,
                    chunk_size, storage_key, state, created_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.upload_id)
            .bind(&session.owner_id)
            .bind(&session.file_name)
            .bind(session.total_size)
            .bind(&session.file_sha256)
            .bind(session.chunk_size)
            .bind(&session.storage_key)
            .bind(&session.state)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_err))
                    if db_err.message().contains("UNIQUE constraint") =>
                {
                    Err(MetadataError::AlreadyExists(format!(
                        "upload session {} or storage key {}",
                        session.upload_id, session.storage_key
                    )))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(&format!(
                "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE upload_id = ?"
            ))
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_sessions_by_owner(
            &self,
            owner_id: &str,
            state: &str,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(&format!(
                "SELECT {SESSION_COLUMNS} FROM upload_sessions \
                 WHERE owner_id = ? AND state = ? ORDER BY created_at ASC"
            ))
            .bind(owner_id)
            .bind(state)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        #[instrument(
            skip(self, chunk, expires_at),
            fields(upload_id = %chunk.upload_id, chunk_index = chunk.chunk_index)
        )]
        async fn mark_chunk_received(
            &self,
            chunk: &UploadChunkRow,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<ChunkMark> {
            let mut tx = self.pool.begin().await?;

            // The state guard and the deadline refresh share one statement so a
            // concurrent abort or expiry cannot slip in between.
            let touched = sqlx::query(
                "UPDATE upload_sessions SET expires_at = ?, updated_at = ? \
                 WHERE upload_id = ? AND state = 'uploading'",
            )
            .bind(expires_at)
            .bind(chunk.received_at)
            .bind(chunk.upload_id)
            .execute(&mut *tx)
            .await?;

            if touched.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(ChunkMark::NotLive);
            }

            let existing: Option<String> = sqlx::query_scalar(
                "SELECT chunk_sha256 FROM upload_chunks WHERE upload_id = ? AND chunk_index = ?",
            )
            .bind(chunk.upload_id)
            .bind(chunk.chunk_index)
            .fetch_optional(&mut *tx)
            .await?;

            let inserted = match existing {
                Some(existing_sha256) if existing_sha256 != chunk.chunk_sha256 => {
                    tx.rollback().await?;
                    return Ok(ChunkMark::HashConflict { existing_sha256 });
                }
                Some(_) => false,
                None => {
                    sqlx::query(
                        "INSERT INTO upload_chunks (upload_id, chunk_index, chunk_sha256, size_bytes, received_at) \
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(chunk.upload_id)
                    .bind(chunk.chunk_index)
                    .bind(&chunk.chunk_sha256)
                    .bind(chunk.size_bytes)
                    .bind(chunk.received_at)
                    .execute(&mut *tx)
                    .await?;
                    true
                }
            };

            let accepted: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?")
                    .bind(chunk.upload_id)
                    .fetch_one(&mut *tx)
                    .await?;

            tx.commit().await?;

            let accepted = accepted as u64;
            Ok(if inserted {
                ChunkMark::Inserted { accepted }
            } else {
                ChunkMark::Duplicate { accepted }
            })
        }

        async fn get_chunk(
            &self,
            upload_id: Uuid,
            chunk_index: i64,
        ) -> MetadataResult<Option<UploadChunkRow>> {
            let row = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE upload_id = ? AND chunk_index = ?",
            )
            .bind(upload_id)
            .bind(chunk_index)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_received_chunks(
            &self,
            upload_id: Uuid,
        ) -> MetadataResult<Vec<UploadChunkRow>> {
            let rows = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index ASC",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_received_chunks(&self, upload_id: Uuid) -> MetadataResult<u64> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?")
                    .bind(upload_id)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count as u64)
        }

        #[instrument(skip(self))]
        async fn remove_chunks(
            &self,
            upload_id: Uuid,
            chunk_indices: &[i64],
        ) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let mut removed = 0;
            for index in chunk_indices {
                let result = sqlx::query(
                    "DELETE FROM upload_chunks WHERE upload_id = ? AND chunk_index = ? \
                     AND EXISTS (SELECT 1 FROM upload_sessions WHERE upload_id = ? AND state = 'uploading')",
                )
                .bind(upload_id)
                .bind(index)
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
                removed += result.rows_affected();
            }
            tx.commit().await?;
            Ok(removed)
        }

        #[instrument(skip(self, updated_at))]
        async fn transition_state(
            &self,
            upload_id: Uuid,
            from: &str,
            to: &str,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET state = ?, updated_at = ? WHERE upload_id = ? AND state = ?",
            )
            .bind(to)
            .bind(updated_at)
            .bind(upload_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_expired_sessions(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(&format!(
                "SELECT {SESSION_COLUMNS} FROM upload_sessions \
                 WHERE state = 'uploading' AND expires_at < ? ORDER BY expires_at ASC LIMIT ?"
            ))
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_terminal_sessions_before(
            &self,
            cutoff: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(&format!(
                "SELECT {SESSION_COLUMNS} FROM upload_sessions \
                 WHERE state != 'uploading' AND updated_at < ? ORDER BY updated_at ASC LIMIT ?"
            ))
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        #[instrument(skip(self))]
        async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn live_session_holds_key(&self, storage_key: &str) -> MetadataResult<bool> {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM upload_sessions WHERE storage_key = ? AND state = 'uploading')",
            )
            .bind(storage_key)
            .fetch_one(&self.pool)
            .await?;
            Ok(exists)
        }

        async fn count_active_uploads(&self) -> MetadataResult<u64> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions WHERE state = 'uploading'")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl QuotaLedger for SqliteStore {
        #[instrument(skip(self))]
        async fn reserve(&self, owner_id: &str, amount: u64, key: Uuid) -> MetadataResult<()> {
            let amount_i64 = to_i64("amount", amount)?;
            let mut tx = self.pool.begin().await?;

            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM quota_reservations WHERE reservation_key = ?)",
            )
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
            if exists {
                tx.commit().await?;
                return Ok(());
            }

            let limit: Option<i64> =
                sqlx::query_scalar("SELECT limit_bytes FROM quota_limits WHERE owner_id = ?")
                    .bind(owner_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let limit = limit.map_or(self.default_quota_limit, |l| l.max(0) as u64);

            let (reserved, used): (i64, i64) = sqlx::query_as(
                "SELECT \
                    COALESCE(SUM(CASE WHEN state = 'reserved' THEN amount ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN state = 'used' THEN amount ELSE 0 END), 0) \
                 FROM quota_reservations WHERE owner_id = ?",
            )
            .bind(owner_id)
            .fetch_one(&mut *tx)
            .await?;

            let usage = QuotaUsage {
                limit,
                reserved: reserved.max(0) as u64,
                used: used.max(0) as u64,
            };
            if amount > usage.available() {
                tx.rollback().await?;
                return Err(MetadataError::QuotaExceeded {
                    owner: owner_id.to_string(),
                    requested: amount,
                    available: usage.available(),
                });
            }

            let now = OffsetDateTime::now_utc();
            sqlx::query(
                "INSERT INTO quota_reservations (reservation_key, owner_id, amount, state, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(key)
            .bind(owner_id)
            .bind(amount_i64)
            .bind(ReservationState::Reserved.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        }

        #[instrument(skip(self))]
        async fn finalize(&self, key: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE quota_reservations SET state = 'used', updated_at = ? \
                 WHERE reservation_key = ? AND state = 'reserved'",
            )
            .bind(OffsetDateTime::now_utc())
            .bind(key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        #[instrument(skip(self))]
        async fn release(&self, key: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE quota_reservations SET state = 'released', updated_at = ? \
                 WHERE reservation_key = ? AND state IN ('reserved', 'used')",
            )
            .bind(OffsetDateTime::now_utc())
            .bind(key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_reservation(
            &self,
            key: Uuid,
        ) -> MetadataResult<Option<QuotaReservationRow>> {
            let row = sqlx::query_as::<_, QuotaReservationRow>(
                "SELECT * FROM quota_reservations WHERE reservation_key = ?",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn usage(&self, owner_id: &str) -> MetadataResult<QuotaUsage> {
            let limit: Option<i64> =
                sqlx::query_scalar("SELECT limit_bytes FROM quota_limits WHERE owner_id = ?")
                    .bind(owner_id)
                    .fetch_optional(&self.pool)
                    .await?;
            let (reserved, used): (i64, i64) = sqlx::query_as(
                "SELECT \
                    COALESCE(SUM(CASE WHEN state = 'reserved' THEN amount ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN state = 'used' THEN amount ELSE 0 END), 0) \
                 FROM quota_reservations WHERE owner_id = ?",
            )
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

            Ok(QuotaUsage {
                limit: limit.map_or(self.default_quota_limit, |l| l.max(0) as u64),
                reserved: reserved.max(0) as u64,
                used: used.max(0) as u64,
            })
        }

        async fn set_limit(&self, owner_id: &str, limit_bytes: u64) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO quota_limits (owner_id, limit_bytes, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(owner_id) DO UPDATE SET limit_bytes = excluded.limit_bytes, \
                 updated_at = excluded.updated_at",
            )
            .bind(owner_id)
            .bind(to_i64("limit_bytes", limit_bytes)?)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceRepo for SqliteStore {
        #[instrument(
            skip(self, file),
            fields(file_id = %file.file_id, storage_key = %file.storage_key)
        )]
        async fn register_file(&self, file: &ResourceFileRow) -> MetadataResult<ResourceFileRow> {
            sqlx::query(
                r#"
                INSERT INTO resource_files (
                    file_id, storage_key, upload_id, owner_id, resource_id,
                    size_bytes, file_sha256, created_at, detached_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(upload_id) DO NOTHING
                "#,
            )
            .bind(file.file_id)
            .bind(&file.storage_key)
            .bind(file.upload_id)
            .bind(&file.owner_id)
            .bind(&file.resource_id)
            .bind(file.size_bytes)
            .bind(&file.file_sha256)
            .bind(file.created_at)
            .bind(file.detached_at)
            .execute(&self.pool)
            .await?;

            let row = match file.upload_id {
                Some(upload_id) => self.get_file_by_upload(upload_id).await?,
                None => sqlx::query_as::<_, ResourceFileRow>(&format!(
                    "SELECT {FILE_COLUMNS} FROM resource_files WHERE file_id = ?"
                ))
                .bind(file.file_id)
                .fetch_optional(&self.pool)
                .await?,
            };
            row.ok_or_else(|| {
                MetadataError::Internal(format!("resource file {} vanished", file.file_id))
            })
        }

        async fn get_file_by_upload(
            &self,
            upload_id: Uuid,
        ) -> MetadataResult<Option<ResourceFileRow>> {
            let row = sqlx::query_as::<_, ResourceFileRow>(&format!(
                "SELECT {FILE_COLUMNS} FROM resource_files WHERE upload_id = ?"
            ))
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn link_resource(&self, file_id: Uuid, resource_id: &str) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE resource_files SET resource_id = ? WHERE file_id = ?")
                .bind(resource_id)
                .bind(file_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("resource file {file_id}")));
            }
            Ok(())
        }

        async fn unlink_resource(&self, file_id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE resource_files SET resource_id = NULL WHERE file_id = ? AND resource_id IS NOT NULL",
            )
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_detached_files(&self, limit: u32) -> MetadataResult<Vec<ResourceFileRow>> {
            let rows = sqlx::query_as::<_, ResourceFileRow>(
                r#"
                SELECT f.file_id, f.storage_key, f.upload_id, f.owner_id, f.resource_id,
                       f.size_bytes, f.file_sha256, f.created_at, f.detached_at
                FROM resource_files f
                LEFT JOIN upload_sessions s ON s.upload_id = f.upload_id
                WHERE f.resource_id IS NULL
                  AND (f.upload_id IS NULL OR s.upload_id IS NULL OR s.state != 'uploading')
                ORDER BY f.created_at ASC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        #[instrument(skip(self, detached_at))]
        async fn detach_file(
            &self,
            file_id: Uuid,
            detached_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE resource_files SET upload_id = NULL, detached_at = ? \
                 WHERE file_id = ? AND detached_at IS NULL",
            )
            .bind(detached_at)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        #[instrument(skip(self))]
        async fn delete_file(&self, file_id: Uuid) -> MetadataResult<()> {
            sqlx::query("DELETE FROM resource_files WHERE file_id = ?")
                .bind(file_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn file_holds_key(&self, storage_key: &str) -> MetadataResult<bool> {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM resource_files WHERE storage_key = ?)",
            )
            .bind(storage_key)
            .fetch_one(&self.pool)
            .await?;
            Ok(exists)
        }
    }

    #[async_trait]
    impl ReaperRunRepo for SqliteStore {
        async fn create_reaper_run(&self, run: &ReaperRunRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO reaper_runs (run_id, state, started_at, finished_at, stats_json) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(run.run_id)
            .bind(&run.state)
            .bind(run.started_at)
            .bind(run.finished_at)
            .bind(&run.stats_json)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_reaper_run(&self, run_id: Uuid) -> MetadataResult<Option<ReaperRunRow>> {
            let row =
                sqlx::query_as::<_, ReaperRunRow>("SELECT * FROM reaper_runs WHERE run_id = ?")
                    .bind(run_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn update_reaper_run(
            &self,
            run_id: Uuid,
            state: &str,
            finished_at: Option<OffsetDateTime>,
            stats_json: Option<&str>,
        ) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE reaper_runs SET state = ?, finished_at = ?, stats_json = ? WHERE run_id = ?",
            )
            .bind(state)
            .bind(finished_at)
            .bind(stats_json)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_recent_reaper_runs(&self, limit: u32) -> MetadataResult<Vec<ReaperRunRow>> {
            let rows = sqlx::query_as::<_, ReaperRunRow>(
                "SELECT * FROM reaper_runs ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn fail_orphaned_reaper_runs(
            &self,
            finished_at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE reaper_runs SET state = 'failed', finished_at = ? WHERE state = 'running'",
            )
            .bind(finished_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Upload sessions
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    owner_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    total_size INTEGER NOT NULL CHECK (total_size > 0),
    file_sha256 TEXT NOT NULL,
    chunk_size INTEGER NOT NULL CHECK (chunk_size > 0),
    storage_key TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'uploading',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state, expires_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner ON upload_sessions(owner_id, state);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_terminal ON upload_sessions(state, updated_at);
-- At most one live session per storage key
CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_sessions_live_key
    ON upload_sessions(storage_key) WHERE state = 'uploading';

-- Accepted chunks
CREATE TABLE IF NOT EXISTS upload_chunks (
    upload_id BLOB NOT NULL,
    chunk_index INTEGER NOT NULL CHECK (chunk_index >= 0),
    chunk_sha256 TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, chunk_index),
    FOREIGN KEY (upload_id) REFERENCES upload_sessions(upload_id) ON DELETE CASCADE
);

-- Quota
CREATE TABLE IF NOT EXISTS quota_limits (
    owner_id TEXT PRIMARY KEY,
    limit_bytes INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS quota_reservations (
    reservation_key BLOB PRIMARY KEY,
    owner_id TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount >= 0),
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quota_reservations_owner ON quota_reservations(owner_id, state);

-- Resource file references (no FK: the session row may be purged first)
CREATE TABLE IF NOT EXISTS resource_files (
    file_id BLOB PRIMARY KEY,
    storage_key TEXT NOT NULL,
    upload_id BLOB UNIQUE,
    owner_id TEXT NOT NULL,
    resource_id TEXT,
    size_bytes INTEGER NOT NULL,
    file_sha256 TEXT NOT NULL,
    created_at TEXT NOT NULL,
    detached_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_resource_files_key ON resource_files(storage_key);
CREATE INDEX IF NOT EXISTS idx_resource_files_unlinked ON resource_files(resource_id, created_at);

-- Cleanup reaper runs
CREATE TABLE IF NOT EXISTS reaper_runs (
    run_id BLOB PRIMARY KEY,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    stats_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_reaper_runs_started ON reaper_runs(started_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMark, ResourceFileRow, UploadChunkRow, UploadSessionRow};
    use tempfile::TempDir;
    use time::OffsetDateTime;
    use uuid::Uuid;

    async fn open_store(limit: u64) -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), limit)
            .await
            .unwrap();
        (store, dir)
    }

    fn session_row(owner: &str, total_size: i64) -> UploadSessionRow {
        let now = OffsetDateTime::now_utc();
        let id = Uuid::new_v4();
        UploadSessionRow {
            upload_id: id,
            owner_id: owner.to_string(),
            file_name: "disk.img".to_string(),
            total_size,
            file_sha256: "ab".repeat(32),
            chunk_size: 4,
            storage_key: format!("uploads/{id}"),
            state: "uploading".to_string(),
            created_at: now,
            updated_at: now,
            expires_at: now + time::Duration::minutes(30),
        }
    }

    fn chunk_row(upload_id: Uuid, index: i64, sha: &str) -> UploadChunkRow {
        UploadChunkRow {
            upload_id,
            chunk_index: index,
            chunk_sha256: sha.to_string(),
            size_bytes: 4,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (store, _dir) = open_store(1024).await;
        let row = session_row("alice", 9);
        store.create_session(&row).await.unwrap();

        let fetched = store.get_session(row.upload_id).await.unwrap().unwrap();
        let session = fetched.into_session().unwrap();
        assert_eq!(session.total_size, 9);
        assert_eq!(session.total_chunks(), 3);
        assert!(store.live_session_holds_key(&row.storage_key).await.unwrap());
        assert_eq!(store.count_active_uploads().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_chunk_semantics() {
        let (store, _dir) = open_store(1024).await;
        let row = session_row("alice", 9);
        store.create_session(&row).await.unwrap();
        let later = row.expires_at + time::Duration::minutes(5);

        let first = store
            .mark_chunk_received(&chunk_row(row.upload_id, 0, "aa"), later)
            .await
            .unwrap();
        assert_eq!(first, ChunkMark::Inserted { accepted: 1 });

        let dup = store
            .mark_chunk_received(&chunk_row(row.upload_id, 0, "aa"), later)
            .await
            .unwrap();
        assert_eq!(dup, ChunkMark::Duplicate { accepted: 1 });

        let even_later = later + time::Duration::minutes(5);
        let conflict = store
            .mark_chunk_received(&chunk_row(row.upload_id, 0, "bb"), even_later)
            .await
            .unwrap();
        assert_eq!(
            conflict,
            ChunkMark::HashConflict {
                existing_sha256: "aa".to_string()
            }
        );

        // Conflicts do not refresh the deadline.
        let session = store.get_session(row.upload_id).await.unwrap().unwrap();
        assert_eq!(session.expires_at, later);
        assert_eq!(store.count_received_chunks(row.upload_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_chunk_requires_live_session() {
        let (store, _dir) = open_store(1024).await;
        let row = session_row("alice", 9);
        store.create_session(&row).await.unwrap();

        let now = OffsetDateTime::now_utc();
        assert!(store
            .transition_state(row.upload_id, "uploading", "aborted", now)
            .await
            .unwrap());

        let mark = store
            .mark_chunk_received(&chunk_row(row.upload_id, 0, "aa"), now)
            .await
            .unwrap();
        assert_eq!(mark, ChunkMark::NotLive);

        let missing = store
            .mark_chunk_received(&chunk_row(Uuid::new_v4(), 0, "aa"), now)
            .await
            .unwrap();
        assert_eq!(missing, ChunkMark::NotLive);
    }

    #[tokio::test]
    async fn test_transition_single_winner() {
        let (store, _dir) = open_store(1024).await;
        let row = session_row("alice", 9);
        store.create_session(&row).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let won = store
            .transition_state(row.upload_id, "uploading", "completed", now)
            .await
            .unwrap();
        let lost = store
            .transition_state(row.upload_id, "uploading", "aborted", now)
            .await
            .unwrap();
        assert!(won);
        assert!(!lost);
        assert!(!store.live_session_holds_key(&row.storage_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_chunks_only_while_uploading() {
        let (store, _dir) = open_store(1024).await;
        let row = session_row("alice", 9);
        store.create_session(&row).await.unwrap();
        let exp = row.expires_at;
        for i in 0..3 {
            store
                .mark_chunk_received(&chunk_row(row.upload_id, i, "aa"), exp)
                .await
                .unwrap();
        }

        assert_eq!(store.remove_chunks(row.upload_id, &[1]).await.unwrap(), 1);
        let indices: Vec<u64> = store
            .get_received_chunks(row.upload_id)
            .await
            .unwrap()
            .iter()
            .map(UploadChunkRow::index)
            .collect();
        assert_eq!(indices, vec![0, 2]);

        store
            .transition_state(row.upload_id, "uploading", "completed", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(store.remove_chunks(row.upload_id, &[0]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_storage_key_is_unique() {
        let (store, _dir) = open_store(1024).await;
        let first = session_row("alice", 9);
        store.create_session(&first).await.unwrap();

        let mut second = session_row("alice", 9);
        second.storage_key = first.storage_key.clone();
        let err = store.create_session(&second).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_expired_and_terminal_queries() {
        let (store, _dir) = open_store(1024).await;
        let mut stale = session_row("alice", 9);
        stale.expires_at = OffsetDateTime::now_utc() - time::Duration::hours(2);
        let fresh = session_row("alice", 9);
        store.create_session(&stale).await.unwrap();
        store.create_session(&fresh).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let expired = store.get_expired_sessions(now, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].upload_id, stale.upload_id);

        store
            .transition_state(stale.upload_id, "uploading", "expired", now)
            .await
            .unwrap();
        let terminal = store
            .get_terminal_sessions_before(now + time::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(terminal.len(), 1);

        store.delete_session(stale.upload_id).await.unwrap();
        assert!(store.get_session(stale.upload_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_reserve_and_release_once() {
        let (store, _dir) = open_store(100).await;
        let key = Uuid::new_v4();

        store.reserve("alice", 60, key).await.unwrap();
        // Same key is a no-op.
        store.reserve("alice", 60, key).await.unwrap();
        assert_eq!(store.usage("alice").await.unwrap().reserved, 60);

        let err = store.reserve("alice", 50, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            MetadataError::QuotaExceeded { available: 40, .. }
        ));

        assert!(store.release(key).await.unwrap());
        assert!(!store.release(key).await.unwrap());
        let usage = store.usage("alice").await.unwrap();
        assert_eq!(usage.reserved, 0);
        assert_eq!(usage.available(), 100);
    }

    #[tokio::test]
    async fn test_quota_finalize_and_limits() {
        let (store, _dir) = open_store(100).await;
        let key = Uuid::new_v4();
        store.reserve("bob", 30, key).await.unwrap();
        assert!(store.finalize(key).await.unwrap());
        assert!(!store.finalize(key).await.unwrap());

        let usage = store.usage("bob").await.unwrap();
        assert_eq!((usage.reserved, usage.used), (0, 30));

        store.set_limit("bob", 40).await.unwrap();
        assert!(store.reserve("bob", 20, Uuid::new_v4()).await.is_err());
        store.set_limit("bob", 50).await.unwrap();
        store.reserve("bob", 20, Uuid::new_v4()).await.unwrap();

        let reservation = store.get_reservation(key).await.unwrap().unwrap();
        assert_eq!(reservation.state, "used");
    }

    #[tokio::test]
    async fn test_resource_files_detach_flow() {
        let (store, _dir) = open_store(1024).await;
        let row = session_row("alice", 9);
        store.create_session(&row).await.unwrap();

        let file = ResourceFileRow {
            file_id: Uuid::new_v4(),
            storage_key: row.storage_key.clone(),
            upload_id: Some(row.upload_id),
            owner_id: "alice".to_string(),
            resource_id: Some(row.upload_id.to_string()),
            size_bytes: 9,
            file_sha256: "ab".repeat(32),
            created_at: OffsetDateTime::now_utc(),
            detached_at: None,
        };
        let registered = store.register_file(&file).await.unwrap();

        // Registering again for the same upload returns the existing row.
        let mut again = file.clone();
        again.file_id = Uuid::new_v4();
        let second = store.register_file(&again).await.unwrap();
        assert_eq!(second.file_id, registered.file_id);
        assert!(store.file_holds_key(&row.storage_key).await.unwrap());

        // Linked files are never returned.
        assert!(store.get_detached_files(10).await.unwrap().is_empty());

        store
            .link_resource(registered.file_id, "dataset-7")
            .await
            .unwrap();
        let linked = store
            .get_file_by_upload(row.upload_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked.resource_id.as_deref(), Some("dataset-7"));
        assert!(matches!(
            store.link_resource(Uuid::new_v4(), "dataset-7").await,
            Err(MetadataError::NotFound(_))
        ));

        assert!(store.unlink_resource(registered.file_id).await.unwrap());
        assert!(!store.unlink_resource(registered.file_id).await.unwrap());
        // Session still uploading: not yet eligible.
        assert!(store.get_detached_files(10).await.unwrap().is_empty());

        store
            .transition_state(row.upload_id, "uploading", "completed", OffsetDateTime::now_utc())
            .await
            .unwrap();
        let detached = store.get_detached_files(10).await.unwrap();
        assert_eq!(detached.len(), 1);

        assert!(store
            .detach_file(registered.file_id, OffsetDateTime::now_utc())
            .await
            .unwrap());
        assert!(!store
            .detach_file(registered.file_id, OffsetDateTime::now_utc())
            .await
            .unwrap());

        store.delete_file(registered.file_id).await.unwrap();
        assert!(!store.file_holds_key(&row.storage_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_reaper_runs_recovery() {
        let (store, _dir) = open_store(1024).await;
        let run = crate::models::ReaperRunRow {
            run_id: Uuid::new_v4(),
            state: "running".to_string(),
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            stats_json: None,
        };
        store.create_reaper_run(&run).await.unwrap();

        let recovered = store
            .fail_orphaned_reaper_runs(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let fetched = store.get_reaper_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(fetched.state, "failed");
        assert!(fetched.finished_at.is_some());
        assert_eq!(store.get_recent_reaper_runs(5).await.unwrap().len(), 1);
    }
}

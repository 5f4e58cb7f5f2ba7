//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Chunk size used when the client does not request one.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// Smallest chunk size a client may negotiate.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// Largest chunk size a client may negotiate.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Upper bound on chunks per session. Chunk size is raised to stay under it.
    #[serde(default = "default_max_chunks_per_session")]
    pub max_chunks_per_session: u64,
    /// Session TTL in seconds, measured from creation or the last accepted chunk.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Largest file a session may declare (0 = unlimited).
    #[serde(default)]
    pub max_file_size: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_min_chunk_size() -> u64 {
    crate::MIN_CHUNK_SIZE
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_max_chunks_per_session() -> u64 {
    crate::MAX_CHUNKS_PER_SESSION
}

fn default_upload_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_chunks_per_session: default_max_chunks_per_session(),
            upload_timeout_secs: default_upload_timeout_secs(),
            max_file_size: 0,
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Get the upload timeout as a Duration.
    pub fn upload_timeout(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.upload_timeout_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Validate chunk sizing invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_chunk_size == 0 {
            return Err("server.min_chunk_size must be at least 1".to_string());
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(format!(
                "server.min_chunk_size {} exceeds server.max_chunk_size {}",
                self.min_chunk_size, self.max_chunk_size
            ));
        }
        if !(self.min_chunk_size..=self.max_chunk_size).contains(&self.default_chunk_size) {
            return Err(format!(
                "server.default_chunk_size {} must lie within [{}, {}]",
                self.default_chunk_size, self.min_chunk_size, self.max_chunk_size
            ));
        }
        if self.max_chunks_per_session == 0 {
            return Err("server.max_chunks_per_session must be at least 1".to_string());
        }
        if self.upload_timeout_secs == 0 {
            return Err("server.upload_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Chunk store backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
        /// Directory under the root that holds session files.
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "uploads".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
            key_prefix: default_key_prefix(),
        }
    }
}

impl StorageConfig {
    /// Prefix under which session files are written and orphans are scanned.
    pub fn key_prefix(&self) -> &str {
        match self {
            Self::Filesystem { key_prefix, .. } => key_prefix,
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        let prefix = self.key_prefix();
        if prefix.is_empty() || prefix.starts_with('/') || prefix.split('/').any(|p| p == "..") {
            return Err(format!(
                "storage.key_prefix {prefix:?} must be a non-empty relative path"
            ));
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Quota ledger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Allotment for owners without an explicit limit.
    #[serde(default = "default_quota_limit_bytes")]
    pub default_limit_bytes: u64,
}

fn default_quota_limit_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit_bytes: default_quota_limit_bytes(),
        }
    }
}

/// Cleanup reaper configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between scheduled runs.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Minimum age before an unclaimed file in the chunk store is deleted.
    #[serde(default = "default_orphan_grace_period_secs")]
    pub orphan_grace_period_secs: u64,
    /// How long terminal session records are kept before being purged.
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
    /// Rows fetched per batch.
    #[serde(default = "default_reaper_batch_size")]
    pub batch_size: u32,
    /// Maximum batches per phase per run.
    #[serde(default = "default_reaper_max_batches")]
    pub max_batches: u32,
    /// Scan the chunk store for unclaimed files.
    #[serde(default = "default_true")]
    pub orphan_scan_enabled: bool,
    /// Run the reaper on `interval_secs` in the background.
    #[serde(default = "default_true")]
    pub auto_schedule_enabled: bool,
}

fn default_reaper_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_orphan_grace_period_secs() -> u64 {
    48 * 3600
}

fn default_terminal_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_reaper_batch_size() -> u32 {
    100
}

fn default_reaper_max_batches() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            orphan_grace_period_secs: default_orphan_grace_period_secs(),
            terminal_retention_secs: default_terminal_retention_secs(),
            batch_size: default_reaper_batch_size(),
            max_batches: default_reaper_max_batches(),
            orphan_scan_enabled: true,
            auto_schedule_enabled: true,
        }
    }
}

impl ReaperConfig {
    /// Get the orphan grace period as a Duration.
    pub fn orphan_grace_period(&self) -> Duration {
        Duration::seconds(self.orphan_grace_period_secs as i64)
    }

    /// Get the terminal retention window as a Duration.
    pub fn terminal_retention(&self) -> Duration {
        Duration::seconds(self.terminal_retention_secs as i64)
    }

    /// Get the run interval as a std::time::Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// Validate reaper configuration for dangerous settings.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("reaper.orphan_grace_period_secs", self.orphan_grace_period_secs),
            ("reaper.terminal_retention_secs", self.terminal_retention_secs),
        ] {
            if value > i64::MAX as u64 {
                return Err(format!(
                    "{name} {value} exceeds maximum value {} (would overflow Duration)",
                    i64::MAX
                ));
            }
        }
        if self.auto_schedule_enabled && self.interval_secs == 0 {
            return Err("reaper.interval_secs cannot be 0 when auto scheduling".to_string());
        }
        if self.batch_size == 0 {
            return Err("reaper.batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A bearer token accepted by the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    /// SHA256 hex of the token.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Owner the token authenticates as.
    pub owner: String,
    /// Whether the token may call admin endpoints.
    #[serde(default)]
    pub admin: bool,
}

/// Authentication configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), String> {
        for token in &self.tokens {
            if token.token_hash.len() != 64
                || !token.token_hash.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(format!(
                    "auth token for owner {:?} must be a 64 character sha256 hex digest",
                    token.owner
                ));
            }
            if token.owner.is_empty() {
                return Err("auth token owner cannot be empty".to_string());
            }
        }
        Ok(())
    }

    /// Test tokens: `test-admin-token` (owner "admin") and
    /// `test-user-token` (owner "alice").
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            tokens: vec![
                TokenConfig {
                    token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                        .to_string(),
                    owner: "admin".to_string(),
                    admin: true,
                },
                TokenConfig {
                    token_hash: "19bbb7d9c45e18a41bced9a036616e2ed096ec57adf02379c46b98edf356b156"
                        .to_string(),
                    owner: "alice".to_string(),
                    admin: false,
                },
            ],
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.storage.validate()?;
        self.reaper.validate()?;
        self.auth.validate()?;
        Ok(())
    }

    /// Create a test configuration rooted at `dir`.
    ///
    /// **For testing only.** Small chunk limits, no background reaper and
    /// the tokens from [`AuthConfig::for_testing`].
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                default_chunk_size: 4,
                min_chunk_size: 1,
                max_chunk_size: 1024 * 1024,
                ..ServerConfig::default()
            },
            storage: StorageConfig::Filesystem {
                path: dir.join("storage"),
                key_prefix: default_key_prefix(),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
            },
            quota: QuotaConfig::default(),
            reaper: ReaperConfig {
                auto_schedule_enabled: false,
                ..ReaperConfig::default()
            },
            auth: AuthConfig::for_testing(),
        }
    }
}

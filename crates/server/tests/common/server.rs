//! Server test utilities.

use ferry_core::config::AppConfig;
use ferry_metadata::{MetadataStore, SqliteStore};
use ferry_server::{AppState, CleanupReaper, UploadCoordinator, create_router};
use ferry_storage::{ChunkStore, FilesystemBackend};
use std::sync::Arc;
use tempfile::TempDir;

/// Raw token for the admin test owner.
#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Raw token for `alice`.
#[allow(dead_code)]
pub const USER_TOKEN: &str = "test-user-token";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with filesystem storage in a temp directory.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let storage: Arc<dyn ChunkStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("storage"))
                .await
                .expect("Failed to create storage backend"),
        );
        Self::build(temp_dir, config, storage).await
    }

    /// Create a test server over the given chunk store.
    pub async fn with_storage<F>(storage: Arc<dyn ChunkStore>, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);
        Self::build(temp_dir, config, storage).await
    }

    async fn build(temp_dir: TempDir, config: AppConfig, storage: Arc<dyn ChunkStore>) -> Self {
        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, config.quota.default_limit_bytes)
                .await
                .expect("Failed to create metadata store"),
        );

        let state = AppState::new(config, storage, metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    pub fn coordinator(&self) -> &Arc<UploadCoordinator> {
        &self.state.coordinator
    }

    pub fn reaper(&self) -> &Arc<CleanupReaper> {
        &self.state.reaper
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    pub fn storage(&self) -> Arc<dyn ChunkStore> {
        self.state.storage.clone()
    }
}

//! An in-process upload backend driven through [`UploadApi`].

use async_trait::async_trait;
use bytes::Bytes;
use ferry_client::{ClientError, ClientResult, UploadApi};
use ferry_core::config::AppConfig;
use ferry_core::upload::{
    AbortUploadResponse, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    OngoingUploadsResponse, UploadStatusResponse, WriteChunkResponse,
};
use ferry_core::{ContentHash, OwnerId, UploadId};
use ferry_metadata::{MetadataStore, SqliteStore};
use ferry_server::{ApiError, AppState, UploadCoordinator};
use ferry_storage::MemoryBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Generate deterministic test data based on a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    data
}

/// Map a coordinator error onto what the HTTP client would report.
#[allow(dead_code)]
pub fn to_client_error(err: ApiError) -> ClientError {
    ClientError::Api {
        code: err.code().to_string(),
        status: err.status_code().as_u16(),
        message: err.to_string(),
        details: err.details(),
    }
}

/// Coordinator, metadata and in-memory chunk store for one test.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestBackend {
    pub state: AppState,
    pub memory: Arc<MemoryBackend>,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestBackend {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(
                temp_dir.path().join("metadata.db"),
                config.quota.default_limit_bytes,
            )
            .await
            .expect("Failed to create metadata store"),
        );
        let memory = Arc::new(MemoryBackend::new());
        let state = AppState::new(config, memory.clone(), metadata);

        Self {
            state,
            memory,
            temp_dir,
        }
    }

    pub fn coordinator(&self) -> &Arc<UploadCoordinator> {
        &self.state.coordinator
    }

    /// An [`UploadApi`] acting as `owner`.
    pub fn api(&self, owner: &str) -> Arc<InProcessApi> {
        Arc::new(InProcessApi {
            coordinator: self.state.coordinator.clone(),
            owner: OwnerId::new(owner),
        })
    }

    /// Write `data` to a file in the test's temp directory.
    pub fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, data).expect("Failed to write test file");
        path
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Calls the coordinator directly instead of going over HTTP.
#[allow(dead_code)]
pub struct InProcessApi {
    coordinator: Arc<UploadCoordinator>,
    owner: OwnerId,
}

#[async_trait]
impl UploadApi for InProcessApi {
    async fn init(&self, request: &InitUploadRequest) -> ClientResult<InitUploadResponse> {
        self.coordinator
            .init(&self.owner, request.clone())
            .await
            .map_err(to_client_error)
    }

    async fn write_chunk(
        &self,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        let len = data.len() as u64;
        self.coordinator
            .write_chunk(
                &self.owner,
                upload_id,
                chunk_index,
                &chunk_sha256.to_hex(),
                data,
                len,
            )
            .await
            .map_err(to_client_error)
    }

    async fn status(&self, upload_id: UploadId) -> ClientResult<UploadStatusResponse> {
        self.coordinator
            .status(&self.owner, upload_id)
            .await
            .map_err(to_client_error)
    }

    async fn complete(&self, upload_id: UploadId) -> ClientResult<CompleteUploadResponse> {
        self.coordinator
            .complete(&self.owner, upload_id)
            .await
            .map_err(to_client_error)
    }

    async fn abort(&self, upload_id: UploadId) -> ClientResult<AbortUploadResponse> {
        self.coordinator
            .abort(&self.owner, upload_id)
            .await
            .map_err(to_client_error)
    }

    async fn list(&self) -> ClientResult<OngoingUploadsResponse> {
        self.coordinator
            .list_ongoing(&self.owner)
            .await
            .map_err(to_client_error)
    }
}

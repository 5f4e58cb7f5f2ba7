//! Application state shared across handlers.

use crate::auth::TokenIndex;
use crate::coordinator::UploadCoordinator;
use crate::reaper::CleanupReaper;
use crate::registrar::{MetadataRegistrar, ResourceRegistrar};
use ferry_core::config::AppConfig;
use ferry_metadata::MetadataStore;
use ferry_storage::ChunkStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Chunk store backend.
    pub storage: Arc<dyn ChunkStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    pub coordinator: Arc<UploadCoordinator>,
    pub reaper: Arc<CleanupReaper>,
    /// Accepted bearer tokens.
    pub tokens: Arc<TokenIndex>,
}

impl AppState {
    /// Create application state with the metadata-backed resource registrar.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ChunkStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let registrar = Arc::new(MetadataRegistrar::new(metadata.clone()));
        Self::with_registrar(config, storage, metadata, registrar)
    }

    /// Create application state with a custom resource registrar.
    pub fn with_registrar(
        config: AppConfig,
        storage: Arc<dyn ChunkStore>,
        metadata: Arc<dyn MetadataStore>,
        registrar: Arc<dyn ResourceRegistrar>,
    ) -> Self {
        if config.auth.tokens.is_empty() {
            tracing::warn!("no auth tokens configured, every upload request will be rejected");
        }

        let coordinator = Arc::new(UploadCoordinator::new(
            &config,
            metadata.clone(),
            storage.clone(),
            registrar,
        ));
        let reaper = Arc::new(CleanupReaper::new(
            coordinator.clone(),
            config.reaper.clone(),
        ));
        let tokens = Arc::new(TokenIndex::from_config(&config.auth));

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            coordinator,
            reaper,
            tokens,
        }
    }
}

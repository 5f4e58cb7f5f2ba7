//! Metadata store for resumable uploads.
//!
//! This crate provides the control-plane data model:
//! - Upload sessions and accepted chunk tracking
//! - Per-owner quota reservations
//! - Resource file references for completed uploads
//! - Cleanup reaper run history

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use ferry_core::config::{MetadataConfig, QuotaConfig};
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    quota: &QuotaConfig,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => {
            let store = SqliteStore::new(path, quota.default_limit_bytes).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

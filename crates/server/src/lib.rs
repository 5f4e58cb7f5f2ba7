//! Upload coordinator, cleanup reaper and HTTP API for ferry.
//!
//! This crate provides the server side of resumable uploads:
//! - Session init, chunk writes, status, completion and abort
//! - Quota reservation through the metadata store
//! - The cleanup reaper for expired sessions and orphaned bytes
//! - Admin and metrics endpoints

pub mod auth;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod reaper;
pub mod registrar;
pub mod routes;
pub mod state;

pub use auth::{AuthenticatedUser, TraceId};
pub use coordinator::{Termination, UploadCoordinator};
pub use error::{ApiError, ApiResult};
pub use reaper::{CleanupReaper, ReaperRunReport};
pub use registrar::{MetadataRegistrar, ResourceRegistrar};
pub use routes::create_router;
pub use state::AppState;

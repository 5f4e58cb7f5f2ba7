//! Repository traits for metadata operations.

pub mod quota;
pub mod reaper;
pub mod resources;
pub mod uploads;

pub use quota::QuotaLedger;
pub use reaper::{ReaperRunRepo, ReaperRunState, ReaperStats};
pub use resources::ResourceRepo;
pub use uploads::UploadRepo;

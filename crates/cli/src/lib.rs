//! Client library for resumable ferry uploads.
//!
//! [`Uploader`] drives a local file through the session protocol against
//! any [`UploadApi`]. [`ApiClient`] is the HTTP implementation.

pub mod api_client;
pub mod error;
pub mod events;
pub mod hashing;
pub mod uploader;

pub use api_client::{ApiClient, UploadApi};
pub use error::{ClientError, ClientResult};
pub use events::{EventBus, SubscriptionId, UploadEvent, UploadPhase};
pub use uploader::{RetryPolicy, UploadOutcome, Uploader, UploaderOptions};

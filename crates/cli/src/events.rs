//! Upload phases and the events an [`Uploader`](crate::Uploader) emits.

use ferry_core::{ContentHash, UploadId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Where an uploader is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadPhase {
    Idle,
    Hashing,
    Uploading,
    Completed,
    Aborted,
    Error,
}

impl UploadPhase {
    /// `Hashing` and `Uploading` have work in flight.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Hashing | Self::Uploading)
    }
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Hashing => "hashing",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Event delivered to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    /// The uploader entered a new phase.
    Status { phase: UploadPhase },
    /// A chunk was accepted by the server.
    Progress {
        uploaded_chunks: u64,
        total_chunks: u64,
        bytes_uploaded: u64,
    },
    /// The server completed the upload.
    Done { upload_id: UploadId },
    /// The upload failed and will not continue on its own.
    Error {
        upload_id: Option<UploadId>,
        code: Option<String>,
        message: String,
    },
    /// A resume target describes a different file than the local one.
    /// The session is left untouched and a new upload is needed.
    FileMismatch {
        upload_id: UploadId,
        local_size: u64,
        remote_size: u64,
        local_sha256: ContentHash,
        remote_sha256: ContentHash,
    },
    /// The upload was cancelled.
    Aborted { upload_id: Option<UploadId> },
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

/// Observer registry.
///
/// Observers run synchronously on the emitting task, so they should be
/// quick. Forward into a channel for anything heavier.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn emit(&self, event: UploadEvent) {
        // Snapshot so observers may subscribe or unsubscribe from inside a callback.
        let observers: Vec<Observer> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(&event);
        }
    }
}

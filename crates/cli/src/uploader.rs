//! Resumable, cancellable file uploader.
//!
//! An [`Uploader`] drives one local file through the session protocol:
//! hash the file, open (or resume) a session, push the missing chunks under
//! a concurrency cap, then ask the server to verify and complete. Progress
//! is reported through [`UploadEvent`]s delivered to registered observers.

use crate::api_client::UploadApi;
use crate::error::{ClientError, ClientResult};
use crate::events::{EventBus, SubscriptionId, UploadEvent, UploadPhase};
use crate::hashing::{self, ChunkReader, FileDigest};
use ferry_core::ChunkLayout;
use ferry_core::UploadId;
use ferry_core::upload::{CompleteUploadResponse, InitUploadRequest, UploadState};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry schedule for chunk writes.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry. Each further retry doubles it.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 1s, 2s, 4s
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploaderOptions {
    /// Maximum concurrent chunk writes.
    pub parallel: usize,
    /// Requested chunk size. The server may pick a different one.
    pub chunk_size: Option<u64>,
    /// Maximum chunks read and hashed at once.
    pub hash_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            parallel: 4,
            chunk_size: None,
            hash_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a `start` or `resume` call ended without an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(CompleteUploadResponse),
    /// The resume target describes a different file. Nothing was uploaded.
    FileMismatch,
    /// [`Uploader::cancel`] stopped the upload.
    Aborted,
}

struct Inner {
    phase: UploadPhase,
    session: Option<UploadId>,
    cancel: CancellationToken,
}

/// Uploads one local file.
pub struct Uploader {
    api: Arc<dyn UploadApi>,
    path: PathBuf,
    options: UploaderOptions,
    events: EventBus,
    inner: Mutex<Inner>,
}

/// Chunks accepted so far, for progress events.
struct Progress {
    total_chunks: u64,
    uploaded_chunks: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl Uploader {
    pub fn new(
        api: Arc<dyn UploadApi>,
        path: impl Into<PathBuf>,
        options: UploaderOptions,
    ) -> Self {
        Self {
            api,
            path: path.into(),
            options,
            events: EventBus::new(),
            inner: Mutex::new(Inner {
                phase: UploadPhase::Idle,
                session: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> UploadPhase {
        self.lock().phase
    }

    /// Session this uploader is working on, if any.
    ///
    /// Kept after an error so the caller can resume later.
    pub fn session_id(&self) -> Option<UploadId> {
        self.lock().session
    }

    /// Register an observer for every subsequent event.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Hash the file, open a new session and upload every chunk.
    pub async fn start(&self) -> ClientResult<UploadOutcome> {
        let cancel = self.begin()?;
        let result = self.run_start(&cancel).await;
        self.settle(&cancel, result)
    }

    /// Continue an existing session, uploading only the chunks it lacks.
    ///
    /// If the session's size or file hash differ from the local file, a
    /// [`UploadEvent::FileMismatch`] is emitted and nothing is uploaded.
    pub async fn resume(&self, upload_id: UploadId) -> ClientResult<UploadOutcome> {
        let cancel = self.begin()?;
        let result = self.run_resume(upload_id, &cancel).await;
        self.settle(&cancel, result)
    }

    /// Stop the running upload and abort its session on the server.
    ///
    /// In-flight requests and hashing workers observe the cancellation and
    /// stop. Local session state is cleared even if the server call fails.
    pub async fn cancel(&self) -> ClientResult<()> {
        let session = {
            let mut inner = self.lock();
            if !inner.phase.is_running() && inner.session.is_none() {
                return Ok(());
            }
            inner.cancel.cancel();
            inner.phase = UploadPhase::Aborted;
            inner.session.take()
        };

        let result = match session {
            Some(upload_id) => match self.api.abort(upload_id).await {
                Ok(response) => {
                    info!(upload_id = %upload_id, state = %response.state, "upload aborted");
                    Ok(())
                }
                Err(err) => {
                    warn!(upload_id = %upload_id, error = %err, "failed to abort session");
                    Err(err)
                }
            },
            None => Ok(()),
        };

        self.events.emit(UploadEvent::Status {
            phase: UploadPhase::Aborted,
        });
        self.events.emit(UploadEvent::Aborted {
            upload_id: session,
        });
        result
    }

    async fn run_start(&self, cancel: &CancellationToken) -> ClientResult<UploadOutcome> {
        let digest = hashing::hash_file(&self.path, cancel).await?;
        debug!(size = digest.size, sha256 = %digest.sha256, "file hashed");

        let request = InitUploadRequest {
            file_name: self.file_name()?,
            total_size: digest.size,
            file_sha256: digest.sha256.to_hex(),
            chunk_size: self.options.chunk_size,
        };
        let init = cancellable(cancel, self.api.init(&request)).await?;
        info!(
            upload_id = %init.upload_id,
            chunk_size = init.chunk_size,
            total_chunks = init.total_chunks,
            "upload session created"
        );
        self.attach(init.upload_id, cancel).await?;

        let layout = ChunkLayout::new(digest.size, init.chunk_size)?;
        let pending: Vec<u64> = (0..layout.total_chunks()).collect();
        self.transfer(init.upload_id, layout, &pending, 0, cancel)
            .await
    }

    async fn run_resume(
        &self,
        upload_id: UploadId,
        cancel: &CancellationToken,
    ) -> ClientResult<UploadOutcome> {
        let digest = hashing::hash_file(&self.path, cancel).await?;
        let status = cancellable(cancel, self.api.status(upload_id)).await?;

        if status.total_size != digest.size || status.file_sha256 != digest.sha256 {
            warn!(
                upload_id = %upload_id,
                local_size = digest.size,
                remote_size = status.total_size,
                "session describes a different file"
            );
            self.file_mismatch(upload_id, digest, &status);
            return Ok(UploadOutcome::FileMismatch);
        }
        if status.state != UploadState::Uploading {
            return Err(not_resumable(upload_id, status.state));
        }

        self.attach(upload_id, cancel).await?;
        let layout = ChunkLayout::new(status.total_size, status.chunk_size)?;
        let missing = status.missing_chunks();
        info!(
            upload_id = %upload_id,
            accepted = status.accepted_chunks.len(),
            missing = missing.len(),
            "resuming upload"
        );
        self.transfer(
            upload_id,
            layout,
            &missing,
            status.accepted_chunks.len() as u64,
            cancel,
        )
        .await
    }

    /// Upload `pending` chunks, then complete the session.
    async fn transfer(
        &self,
        upload_id: UploadId,
        layout: ChunkLayout,
        pending: &[u64],
        already_accepted: u64,
        cancel: &CancellationToken,
    ) -> ClientResult<UploadOutcome> {
        let reader = ChunkReader::new(&self.path, layout, self.options.hash_workers);
        let progress = Progress {
            total_chunks: layout.total_chunks(),
            uploaded_chunks: AtomicU64::new(already_accepted),
            bytes_uploaded: AtomicU64::new(0),
        };

        self.upload_chunks(upload_id, &reader, pending, &progress, cancel)
            .await?;
        let response = self
            .complete(upload_id, &reader, &progress, cancel)
            .await?;
        Ok(UploadOutcome::Completed(response))
    }

    async fn upload_chunks(
        &self,
        upload_id: UploadId,
        reader: &ChunkReader,
        indices: &[u64],
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let parallel = self.options.parallel.max(1);
        let mut in_flight = FuturesUnordered::new();

        for &index in indices {
            in_flight.push(self.upload_chunk(upload_id, reader, index, progress, cancel));

            if in_flight.len() >= parallel
                && let Some(result) = in_flight.next().await
            {
                result?;
            }
        }

        while let Some(result) = in_flight.next().await {
            result?;
        }
        Ok(())
    }

    /// Write one chunk, retrying transient failures and damaged transfers.
    async fn upload_chunk(
        &self,
        upload_id: UploadId,
        reader: &ChunkReader,
        index: u64,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let retry = self.options.retry;
        let mut attempt = 0;
        let mut chunk = reader.read(index, cancel).await?;

        loop {
            let write = self
                .api
                .write_chunk(upload_id, index, &chunk.sha256, chunk.data.clone());
            match cancellable(cancel, write).await {
                Ok(_) => break,
                Err(err)
                    if (err.is_transient() || err.is_chunk_checksum_mismatch())
                        && attempt < retry.max_retries =>
                {
                    attempt += 1;
                    let delay = retry.delay(attempt);
                    warn!(
                        upload_id = %upload_id,
                        chunk_index = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk write failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if err.is_chunk_checksum_mismatch() {
                        chunk = reader.read(index, cancel).await?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let uploaded_chunks = progress.uploaded_chunks.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes_uploaded = progress
            .bytes_uploaded
            .fetch_add(chunk.data.len() as u64, Ordering::SeqCst)
            + chunk.data.len() as u64;
        debug!(
            upload_id = %upload_id,
            chunk_index = index,
            bytes = chunk.data.len(),
            "chunk accepted"
        );
        self.events.emit(UploadEvent::Progress {
            uploaded_chunks: uploaded_chunks.min(progress.total_chunks),
            total_chunks: progress.total_chunks,
            bytes_uploaded,
        });
        Ok(())
    }

    /// Complete the session.
    ///
    /// Chunks the server reports as corrupt are uploaded again and
    /// completion is retried once. A whole-file mismatch with every chunk
    /// intact means the declared hash is wrong, so the session is aborted.
    async fn complete(
        &self,
        upload_id: UploadId,
        reader: &ChunkReader,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> ClientResult<CompleteUploadResponse> {
        let err = match cancellable(cancel, self.api.complete(upload_id)).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_chunk_checksum_mismatch() => err,
            Err(err) => return Err(err),
        };

        let mismatched = err.mismatched_chunks().to_vec();
        if mismatched.is_empty() {
            warn!(
                upload_id = %upload_id,
                "file hash mismatch with intact chunks, aborting session"
            );
            if let Err(abort_err) = self.api.abort(upload_id).await {
                warn!(upload_id = %upload_id, error = %abort_err, "failed to abort session");
            }
            self.lock().session = None;
            return Err(err);
        }

        warn!(
            upload_id = %upload_id,
            chunks = ?mismatched,
            "server rejected stored chunks, uploading them again"
        );
        progress
            .uploaded_chunks
            .fetch_sub(mismatched.len() as u64, Ordering::SeqCst);
        self.upload_chunks(upload_id, reader, &mismatched, progress, cancel)
            .await?;
        cancellable(cancel, self.api.complete(upload_id)).await
    }

    /// Claim the uploader for a new run.
    fn begin(&self) -> ClientResult<CancellationToken> {
        let cancel = {
            let mut inner = self.lock();
            if inner.phase.is_running() {
                return Err(ClientError::Busy);
            }
            inner.phase = UploadPhase::Hashing;
            inner.session = None;
            inner.cancel = CancellationToken::new();
            inner.cancel.clone()
        };
        self.events.emit(UploadEvent::Status {
            phase: UploadPhase::Hashing,
        });
        Ok(cancel)
    }

    /// Record the session and enter `Uploading`.
    ///
    /// If `cancel` won the race, the freshly opened session is aborted here
    /// since [`Uploader::cancel`] could not see it.
    async fn attach(&self, upload_id: UploadId, cancel: &CancellationToken) -> ClientResult<()> {
        let cancelled = {
            let mut inner = self.lock();
            if cancel.is_cancelled() {
                true
            } else {
                inner.session = Some(upload_id);
                inner.phase = UploadPhase::Uploading;
                false
            }
        };
        if cancelled {
            if let Err(err) = self.api.abort(upload_id).await {
                warn!(upload_id = %upload_id, error = %err, "failed to abort session");
            }
            return Err(ClientError::Cancelled);
        }
        self.events.emit(UploadEvent::Status {
            phase: UploadPhase::Uploading,
        });
        Ok(())
    }

    /// Publish the final phase for a run and translate cancellation.
    fn settle(
        &self,
        cancel: &CancellationToken,
        result: ClientResult<UploadOutcome>,
    ) -> ClientResult<UploadOutcome> {
        match result {
            Err(_) if cancel.is_cancelled() => Ok(UploadOutcome::Aborted),
            Err(ClientError::Cancelled) => Ok(UploadOutcome::Aborted),
            Ok(UploadOutcome::Completed(response)) => {
                {
                    let mut inner = self.lock();
                    if inner.phase == UploadPhase::Aborted {
                        return Ok(UploadOutcome::Aborted);
                    }
                    inner.phase = UploadPhase::Completed;
                    inner.session = None;
                }
                info!(upload_id = %response.upload_id, "upload completed");
                self.events.emit(UploadEvent::Status {
                    phase: UploadPhase::Completed,
                });
                self.events.emit(UploadEvent::Done {
                    upload_id: response.upload_id,
                });
                Ok(UploadOutcome::Completed(response))
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let upload_id = {
                    let mut inner = self.lock();
                    inner.phase = UploadPhase::Error;
                    inner.session
                };
                self.events.emit(UploadEvent::Status {
                    phase: UploadPhase::Error,
                });
                self.events.emit(UploadEvent::Error {
                    upload_id,
                    code: err.code().map(str::to_string),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn file_mismatch(
        &self,
        upload_id: UploadId,
        digest: FileDigest,
        status: &ferry_core::upload::UploadStatusResponse,
    ) {
        {
            let mut inner = self.lock();
            inner.phase = UploadPhase::Idle;
            inner.session = None;
        }
        self.events.emit(UploadEvent::FileMismatch {
            upload_id,
            local_size: digest.size,
            remote_size: status.total_size,
            local_sha256: digest.sha256,
            remote_sha256: status.file_sha256,
        });
        self.events.emit(UploadEvent::Status {
            phase: UploadPhase::Idle,
        });
    }

    fn file_name(&self) -> ClientResult<String> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", self.path.display()),
                ))
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Error for a resume target that no longer accepts chunks, classed the way
/// the server classes writes to such a session.
fn not_resumable(upload_id: UploadId, state: UploadState) -> ClientError {
    let (code, status) = match state {
        UploadState::Expired => ("expired", 410),
        _ => ("conflict", 409),
    };
    ClientError::Api {
        code: code.to_string(),
        status,
        message: format!("upload {upload_id} is {state}"),
        details: None,
    }
}

/// Run `fut` unless `cancel` fires first. Dropping the future cancels the
/// underlying request.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        result = fut => result,
    }
}

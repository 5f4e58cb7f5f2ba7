//! [`UploadApi`] wrappers that count calls or inject faults.

use async_trait::async_trait;
use bytes::Bytes;
use ferry_client::{ClientError, ClientResult, UploadApi};
use ferry_core::upload::{
    AbortUploadResponse, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    OngoingUploadsResponse, UploadStatusResponse, WriteChunkResponse,
};
use ferry_core::{ContentHash, UploadId};
use ferry_storage::{ChunkStore, MemoryBackend};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Chunk writes that reach the wrapped API are forwarded here. Everything
/// else passes straight through.
#[allow(dead_code)]
#[async_trait]
pub trait WriteHook: Send + Sync {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse>;

    async fn complete(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
    ) -> ClientResult<CompleteUploadResponse> {
        inner.complete(upload_id).await
    }
}

/// Wraps an API and records every call.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct CountingApi {
    inner: Arc<dyn UploadApi>,
    hook: Option<Arc<dyn WriteHook>>,
    writes: Mutex<Vec<u64>>,
    pub inits: AtomicUsize,
    pub statuses: AtomicUsize,
    pub completes: AtomicUsize,
    pub aborts: AtomicUsize,
}

#[allow(dead_code)]
impl CountingApi {
    pub fn new(inner: Arc<dyn UploadApi>) -> Arc<Self> {
        Arc::new(Self::build(inner, None))
    }

    pub fn with_hook(inner: Arc<dyn UploadApi>, hook: Arc<dyn WriteHook>) -> Arc<Self> {
        Arc::new(Self::build(inner, Some(hook)))
    }

    fn build(inner: Arc<dyn UploadApi>, hook: Option<Arc<dyn WriteHook>>) -> Self {
        Self {
            inner,
            hook,
            writes: Mutex::new(Vec::new()),
            inits: AtomicUsize::new(0),
            statuses: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Chunk indices written, in call order, including failed attempts.
    pub fn writes(&self) -> Vec<u64> {
        self.writes.lock().unwrap().clone()
    }

    /// Distinct chunk indices written, sorted.
    pub fn written_indices(&self) -> Vec<u64> {
        let mut indices = self.writes();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl UploadApi for CountingApi {
    async fn init(&self, request: &InitUploadRequest) -> ClientResult<InitUploadResponse> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.inner.init(request).await
    }

    async fn write_chunk(
        &self,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        self.writes.lock().unwrap().push(chunk_index);
        match &self.hook {
            Some(hook) => {
                hook.write_chunk(
                    self.inner.as_ref(),
                    upload_id,
                    chunk_index,
                    chunk_sha256,
                    data,
                )
                .await
            }
            None => {
                self.inner
                    .write_chunk(upload_id, chunk_index, chunk_sha256, data)
                    .await
            }
        }
    }

    async fn status(&self, upload_id: UploadId) -> ClientResult<UploadStatusResponse> {
        self.statuses.fetch_add(1, Ordering::SeqCst);
        self.inner.status(upload_id).await
    }

    async fn complete(&self, upload_id: UploadId) -> ClientResult<CompleteUploadResponse> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        match &self.hook {
            Some(hook) => hook.complete(self.inner.as_ref(), upload_id).await,
            None => self.inner.complete(upload_id).await,
        }
    }

    async fn abort(&self, upload_id: UploadId) -> ClientResult<AbortUploadResponse> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort(upload_id).await
    }

    async fn list(&self) -> ClientResult<OngoingUploadsResponse> {
        self.inner.list().await
    }
}

/// Fails the first `n` writes of chosen chunks with a 503.
#[allow(dead_code)]
pub struct Unavailable {
    remaining: Mutex<HashMap<u64, u32>>,
}

#[allow(dead_code)]
impl Unavailable {
    pub fn new(failures: &[(u64, u32)]) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(failures.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl WriteHook for Unavailable {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        let fail = {
            let mut remaining = self.remaining.lock().unwrap();
            match remaining.get_mut(&chunk_index) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(ClientError::Api {
                code: "storage_error".to_string(),
                status: 503,
                message: "injected outage".to_string(),
                details: None,
            });
        }
        inner
            .write_chunk(upload_id, chunk_index, chunk_sha256, data)
            .await
    }
}

/// Flips one byte of the body on the first write of `chunk_index`, as if
/// the transfer were damaged. The declared hash is left intact.
#[allow(dead_code)]
pub struct DamageInTransit {
    chunk_index: u64,
    fired: AtomicBool,
}

#[allow(dead_code)]
impl DamageInTransit {
    pub fn new(chunk_index: u64) -> Arc<Self> {
        Arc::new(Self {
            chunk_index,
            fired: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl WriteHook for DamageInTransit {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        let data = if chunk_index == self.chunk_index && !self.fired.swap(true, Ordering::SeqCst)
        {
            let mut damaged = data.to_vec();
            damaged[0] ^= 0xff;
            Bytes::from(damaged)
        } else {
            data
        };
        inner
            .write_chunk(upload_id, chunk_index, chunk_sha256, data)
            .await
    }
}

/// Overwrites a stored chunk right before the first `complete`, so the
/// server finds it corrupt during verification.
#[allow(dead_code)]
pub struct CorruptBeforeComplete {
    memory: Arc<MemoryBackend>,
    chunk_index: u64,
    chunk_size: u64,
    fired: AtomicBool,
}

#[allow(dead_code)]
impl CorruptBeforeComplete {
    pub fn new(memory: Arc<MemoryBackend>, chunk_index: u64, chunk_size: u64) -> Arc<Self> {
        Arc::new(Self {
            memory,
            chunk_index,
            chunk_size,
            fired: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl WriteHook for CorruptBeforeComplete {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        inner
            .write_chunk(upload_id, chunk_index, chunk_sha256, data)
            .await
    }

    async fn complete(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
    ) -> ClientResult<CompleteUploadResponse> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let garbage = Bytes::from(vec![0u8; self.chunk_size as usize]);
            self.memory
                .write_at(
                    &format!("uploads/{upload_id}"),
                    self.chunk_index * self.chunk_size,
                    garbage,
                )
                .await
                .unwrap();
        }
        inner.complete(upload_id).await
    }
}

/// Lets `allowed` writes through, then parks every later write until the
/// caller cancels. `stalled` fires when the first write parks.
#[allow(dead_code)]
pub struct Stall {
    allowed: AtomicUsize,
    pub stalled: Notify,
}

#[allow(dead_code)]
impl Stall {
    pub fn after(allowed: usize) -> Arc<Self> {
        Arc::new(Self {
            allowed: AtomicUsize::new(allowed),
            stalled: Notify::new(),
        })
    }
}

#[async_trait]
impl WriteHook for Stall {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        let pass = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pass {
            return inner
                .write_chunk(upload_id, chunk_index, chunk_sha256, data)
                .await;
        }
        self.stalled.notify_one();
        std::future::pending().await
    }
}

/// Holds every write for `delay` and records the most writes seen in
/// flight at once.
#[allow(dead_code)]
pub struct PeakConcurrency {
    delay: Duration,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

#[allow(dead_code)]
impl PeakConcurrency {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WriteHook for PeakConcurrency {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = inner
            .write_chunk(upload_id, chunk_index, chunk_sha256, data)
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Answers every `complete` with a whole-file checksum mismatch that names
/// no chunks, as if the declared file hash were wrong.
#[allow(dead_code)]
pub struct WrongFileHash;

#[allow(dead_code)]
impl WrongFileHash {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl WriteHook for WrongFileHash {
    async fn write_chunk(
        &self,
        inner: &dyn UploadApi,
        upload_id: UploadId,
        chunk_index: u64,
        chunk_sha256: &ContentHash,
        data: Bytes,
    ) -> ClientResult<WriteChunkResponse> {
        inner
            .write_chunk(upload_id, chunk_index, chunk_sha256, data)
            .await
    }

    async fn complete(
        &self,
        _inner: &dyn UploadApi,
        upload_id: UploadId,
    ) -> ClientResult<CompleteUploadResponse> {
        Err(ClientError::Api {
            code: "checksum_mismatch".to_string(),
            status: 422,
            message: format!("checksum mismatch: assembled file {upload_id} has another hash"),
            details: None,
        })
    }
}

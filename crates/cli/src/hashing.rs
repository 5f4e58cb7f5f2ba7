//! File and chunk hashing on the blocking thread pool.
//!
//! Hashing never runs on the async workers, so a large file being digested
//! does not stall chunk transfers. Every entry point takes the uploader's
//! cancellation token and returns [`ClientError::Cancelled`] once it fires.

use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use ferry_core::{ChunkLayout, ContentHash, ContentHasher};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Size and SHA-256 of a local file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: ContentHash,
}

/// Hash a whole file.
///
/// The worker checks the token between reads and stops early when it fires.
pub async fn hash_file(path: &Path, cancel: &CancellationToken) -> ClientResult<FileDigest> {
    let path = path.to_path_buf();
    let token = cancel.clone();
    let task = tokio::task::spawn_blocking(move || hash_file_blocking(&path, &token));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        joined = task => joined.map_err(join_error)?,
    }
}

fn hash_file_blocking(path: &Path, cancel: &CancellationToken) -> ClientResult<FileDigest> {
    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(FileDigest {
        size,
        sha256: hasher.finalize(),
    })
}

/// One chunk read from disk together with its hash.
#[derive(Clone, Debug)]
pub struct HashedChunk {
    pub index: u64,
    pub data: Bytes,
    pub sha256: ContentHash,
}

/// Reads and hashes chunks of one file with bounded parallelism.
#[derive(Clone)]
pub struct ChunkReader {
    path: Arc<PathBuf>,
    layout: ChunkLayout,
    permits: Arc<Semaphore>,
}

impl ChunkReader {
    pub fn new(path: impl Into<PathBuf>, layout: ChunkLayout, workers: usize) -> Self {
        Self {
            path: Arc::new(path.into()),
            layout,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Read chunk `index` and compute its hash.
    pub async fn read(&self, index: u64, cancel: &CancellationToken) -> ClientResult<HashedChunk> {
        let range = self.layout.chunk_range(index)?;
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| ClientError::Cancelled)?,
        };

        let path = self.path.clone();
        let task = tokio::task::spawn_blocking(move || {
            let data = read_range(&path, range)?;
            let sha256 = ContentHash::compute(&data);
            Ok::<_, ClientError>((data, sha256))
        });
        let (data, sha256) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            joined = task => joined.map_err(join_error)??,
        };
        Ok(HashedChunk {
            index,
            data,
            sha256,
        })
    }
}

fn read_range(path: &Path, range: Range<u64>) -> ClientResult<Bytes> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut data = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut data)?;
    Ok(Bytes::from(data))
}

fn join_error(err: tokio::task::JoinError) -> ClientError {
    ClientError::Io(std::io::Error::other(format!("hashing task failed: {err}")))
}

//! Chunk layout arithmetic.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How a file of `total_size` bytes is split into chunks of `chunk_size`.
///
/// Every chunk is `chunk_size` bytes except possibly the last, which holds
/// the remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
}

impl ChunkLayout {
    /// Build a layout. Both sizes must be non-zero.
    pub fn new(total_size: u64, chunk_size: u64) -> crate::Result<Self> {
        if chunk_size == 0 {
            return Err(crate::Error::InvalidChunkSize {
                size: 0,
                min: 1,
                max: u64::MAX,
            });
        }
        if total_size == 0 {
            return Err(crate::Error::UploadSession(
                "total size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// Number of chunks: `ceil(total_size / chunk_size)`.
    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Check that `index` lies in `[0, total_chunks)`.
    pub fn check_index(&self, index: u64) -> crate::Result<()> {
        let total = self.total_chunks();
        if index >= total {
            return Err(crate::Error::InvalidChunkIndex { index, total });
        }
        Ok(())
    }

    /// Byte offset where chunk `index` starts.
    pub fn offset_of(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Expected length of chunk `index`.
    pub fn chunk_len(&self, index: u64) -> crate::Result<u64> {
        self.check_index(index)?;
        let start = self.offset_of(index);
        Ok((self.total_size - start).min(self.chunk_size))
    }

    /// Byte range covered by chunk `index`.
    pub fn chunk_range(&self, index: u64) -> crate::Result<Range<u64>> {
        let len = self.chunk_len(index)?;
        let start = self.offset_of(index);
        Ok(start..start + len)
    }

    /// Length of the final chunk.
    pub fn last_chunk_len(&self) -> u64 {
        self.total_size - self.chunk_size * (self.total_chunks() - 1)
    }

    /// Indices in `[0, total_chunks)` not present in `accepted`.
    pub fn missing(&self, accepted: &[u64]) -> Vec<u64> {
        let mut present = vec![false; self.total_chunks() as usize];
        for &idx in accepted {
            if let Some(slot) = present.get_mut(idx as usize) {
                *slot = true;
            }
        }
        present
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(i, _)| i as u64)
            .collect()
    }
}

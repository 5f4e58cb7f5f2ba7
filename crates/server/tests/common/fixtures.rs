//! Test fixtures for generating test data.

use bytes::Bytes;
use ferry_core::upload::InitUploadRequest;
use ferry_core::{ContentHash, OwnerId};
use ferry_metadata::MetadataStore;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Compute SHA-256 hash of data as hex string.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

/// Split data into chunks of specified size.
#[allow(dead_code)]
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    data.chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// The owner behind `test-user-token`.
#[allow(dead_code)]
pub fn alice() -> OwnerId {
    OwnerId::new("alice")
}

/// An owner with no token, for cross-owner checks.
#[allow(dead_code)]
pub fn mallory() -> OwnerId {
    OwnerId::new("mallory")
}

/// Init request describing `data`.
#[allow(dead_code)]
pub fn init_request(name: &str, data: &[u8], chunk_size: Option<u64>) -> InitUploadRequest {
    InitUploadRequest {
        file_name: name.to_string(),
        total_size: data.len() as u64,
        file_sha256: sha256_hash(data),
        chunk_size,
    }
}

/// Push a session's deadline `ago` into the past.
///
/// Replays an already accepted chunk, which refreshes the deadline to the
/// given value without changing the accepted set.
#[allow(dead_code)]
pub async fn backdate_deadline(metadata: &dyn MetadataStore, upload_id: Uuid, ago: Duration) {
    let chunk = metadata
        .get_received_chunks(upload_id)
        .await
        .expect("failed to read chunks")
        .into_iter()
        .next()
        .expect("backdate_deadline needs at least one accepted chunk");
    metadata
        .mark_chunk_received(&chunk, OffsetDateTime::now_utc() - ago)
        .await
        .expect("failed to backdate deadline");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn test_split_into_chunks() {
        let data = seeded_bytes(1, 100);
        let chunks = split_into_chunks(&data, 30);
        assert_eq!(chunks.len(), 4); // 30 + 30 + 30 + 10

        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(reassembled, data.as_ref());
    }
}

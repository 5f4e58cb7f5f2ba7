//! Uploader behavior against an in-process coordinator.

mod common;

use common::{
    CorruptBeforeComplete, CountingApi, DamageInTransit, PeakConcurrency, Stall, TestBackend,
    Unavailable, WrongFileHash, seeded_bytes,
};
use ferry_client::{
    ClientError, RetryPolicy, UploadApi, UploadEvent, UploadOutcome, UploadPhase, Uploader,
    UploaderOptions,
};
use ferry_core::upload::InitUploadRequest;
use ferry_core::{ContentHash, OwnerId, UploadId, UploadState};
use ferry_storage::ChunkStoreExt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

fn fast_options() -> UploaderOptions {
    UploaderOptions {
        parallel: 2,
        chunk_size: None,
        hash_workers: 2,
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        },
    }
}

fn uploader(api: Arc<dyn UploadApi>, path: PathBuf) -> Arc<Uploader> {
    Arc::new(Uploader::new(api, path, fast_options()))
}

fn record(uploader: &Uploader) -> Arc<Mutex<Vec<UploadEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    uploader.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn phases(events: &[UploadEvent]) -> Vec<UploadPhase> {
    events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Status { phase } => Some(*phase),
            _ => None,
        })
        .collect()
}

fn writes_of(api: &CountingApi, index: u64) -> usize {
    api.writes().iter().filter(|&&i| i == index).count()
}

fn alice() -> OwnerId {
    OwnerId::new("alice")
}

/// Open a session for `data` in 4-byte chunks and upload `chunks` directly.
async fn seed_session(backend: &TestBackend, data: &[u8], chunks: &[u64]) -> UploadId {
    let init = backend
        .coordinator()
        .init(
            &alice(),
            InitUploadRequest {
                file_name: "seeded.bin".to_string(),
                total_size: data.len() as u64,
                file_sha256: ContentHash::compute(data).to_hex(),
                chunk_size: Some(4),
            },
        )
        .await
        .unwrap();
    for &index in chunks {
        let start = (index * 4) as usize;
        let chunk = bytes::Bytes::copy_from_slice(&data[start..(start + 4).min(data.len())]);
        backend
            .coordinator()
            .write_chunk(
                &alice(),
                init.upload_id,
                index,
                &ContentHash::compute(&chunk).to_hex(),
                chunk.clone(),
                chunk.len() as u64,
            )
            .await
            .unwrap();
    }
    init.upload_id
}

#[tokio::test]
async fn test_start_uploads_every_chunk_and_completes() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(1, 10);
    let path = backend.write_file("report.bin", &data);
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    let outcome = uploader.start().await.unwrap();
    let UploadOutcome::Completed(response) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(response.total_size, 10);
    assert_eq!(response.file_sha256, ContentHash::compute(&data));

    assert_eq!(api.written_indices(), vec![0, 1, 2]);
    assert_eq!(api.write_count(), 3);
    assert_eq!(api.completes.load(Ordering::SeqCst), 1);
    assert_eq!(uploader.phase(), UploadPhase::Completed);
    assert!(uploader.session_id().is_none());

    let status = backend
        .coordinator()
        .status(&alice(), response.upload_id)
        .await
        .unwrap();
    assert_eq!(status.state, UploadState::Completed);

    let events = events.lock().unwrap();
    assert_eq!(
        phases(&events),
        vec![
            UploadPhase::Hashing,
            UploadPhase::Uploading,
            UploadPhase::Completed
        ]
    );
    assert_eq!(
        events.last(),
        Some(&UploadEvent::Done {
            upload_id: response.upload_id
        })
    );
    let progress: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Progress {
                uploaded_chunks,
                total_chunks,
                bytes_uploaded,
            } => Some((*uploaded_chunks, *total_chunks, *bytes_uploaded)),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last().map(|p| (p.0, p.1)), Some((3, 3)));
    assert_eq!(progress.iter().map(|p| p.2).max(), Some(10));
}

#[tokio::test]
async fn test_chunk_writes_stay_within_parallel_limit() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(15, 40);
    let path = backend.write_file("wide.bin", &data);
    let hook = PeakConcurrency::new(Duration::from_millis(20));
    let api = CountingApi::with_hook(backend.api("alice"), hook.clone());
    let options = UploaderOptions {
        parallel: 3,
        ..fast_options()
    };
    let uploader = Uploader::new(api.clone(), path, options);

    assert!(matches!(
        uploader.start().await.unwrap(),
        UploadOutcome::Completed(_)
    ));
    assert_eq!(api.write_count(), 10);
    let peak = hook.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "{peak} writes in flight with parallel = 3");
    assert!(peak >= 2, "writes never overlapped");
}

#[tokio::test]
async fn test_requested_chunk_size_is_negotiated() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(2, 10);
    let path = backend.write_file("sized.bin", &data);
    let api = CountingApi::new(backend.api("alice"));
    let options = UploaderOptions {
        chunk_size: Some(5),
        ..fast_options()
    };
    let uploader = Uploader::new(api.clone(), path, options);

    assert!(matches!(
        uploader.start().await.unwrap(),
        UploadOutcome::Completed(_)
    ));
    assert_eq!(api.written_indices(), vec![0, 1]);
}

#[tokio::test]
async fn test_resume_uploads_only_missing_chunks() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(3, 16);
    let path = backend.write_file("resume.bin", &data);
    let upload_id = seed_session(&backend, &data, &[0, 2]).await;

    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    let outcome = uploader.resume(upload_id).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed(ref r) if r.upload_id == upload_id));
    assert_eq!(api.written_indices(), vec![1, 3]);
    assert_eq!(api.inits.load(Ordering::SeqCst), 0);

    let stored = backend
        .memory
        .read_all(&format!("uploads/{upload_id}"))
        .await
        .unwrap();
    assert_eq!(&stored[..], &data[..]);

    let events = events.lock().unwrap();
    let uploaded: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Progress {
                uploaded_chunks, ..
            } => Some(*uploaded_chunks),
            _ => None,
        })
        .collect();
    assert_eq!(uploaded.len(), 2);
    assert_eq!(uploaded.iter().max(), Some(&4));
}

#[tokio::test]
async fn test_resume_size_mismatch_uploads_nothing() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(4, 16);
    let upload_id = seed_session(&backend, &data, &[0]).await;

    let other = seeded_bytes(4, 12);
    let path = backend.write_file("other.bin", &other);
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    assert_eq!(
        uploader.resume(upload_id).await.unwrap(),
        UploadOutcome::FileMismatch
    );
    assert_eq!(api.write_count(), 0);
    assert_eq!(api.completes.load(Ordering::SeqCst), 0);
    assert_eq!(api.aborts.load(Ordering::SeqCst), 0);
    assert_eq!(uploader.phase(), UploadPhase::Idle);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        UploadEvent::FileMismatch {
            upload_id: id,
            local_size: 12,
            remote_size: 16,
            ..
        } if *id == upload_id
    )));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, UploadEvent::Error { .. }))
    );

    // The session itself is left for its owner to deal with.
    let status = backend
        .coordinator()
        .status(&alice(), upload_id)
        .await
        .unwrap();
    assert_eq!(status.state, UploadState::Uploading);
}

#[tokio::test]
async fn test_resume_hash_mismatch_uploads_nothing() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(5, 16);
    let upload_id = seed_session(&backend, &data, &[]).await;

    let path = backend.write_file("same-size.bin", &seeded_bytes(6, 16));
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);

    assert_eq!(
        uploader.resume(upload_id).await.unwrap(),
        UploadOutcome::FileMismatch
    );
    assert_eq!(api.write_count(), 0);
}

#[tokio::test]
async fn test_resume_of_completed_session_is_an_error() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(7, 8);
    let upload_id = seed_session(&backend, &data, &[0, 1]).await;
    backend
        .coordinator()
        .complete(&alice(), upload_id)
        .await
        .unwrap();

    let path = backend.write_file("done.bin", &data);
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);

    let err = uploader.resume(upload_id).await.unwrap_err();
    assert_eq!(err.code(), Some("conflict"));
    assert_eq!(api.write_count(), 0);
    assert_eq!(uploader.phase(), UploadPhase::Error);
}

#[tokio::test]
async fn test_resume_of_expired_session_reports_expired() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(16, 8);
    let upload_id = seed_session(&backend, &data, &[0]).await;
    let expired = backend
        .state
        .metadata
        .transition_state(
            *upload_id.as_uuid(),
            "uploading",
            "expired",
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert!(expired);

    let path = backend.write_file("late.bin", &data);
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    let err = uploader.resume(upload_id).await.unwrap_err();
    assert_eq!(err.code(), Some("expired"));
    assert!(matches!(err, ClientError::Api { status: 410, .. }));
    assert_eq!(api.write_count(), 0);
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        UploadEvent::Error { code: Some(code), .. } if code == "expired"
    )));
}

#[tokio::test]
async fn test_cancel_aborts_server_session() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(8, 20);
    let path = backend.write_file("cancel.bin", &data);
    let stall = Stall::after(1);
    let api = CountingApi::with_hook(backend.api("alice"), stall.clone());
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    let task = {
        let uploader = uploader.clone();
        tokio::spawn(async move { uploader.start().await })
    };
    stall.stalled.notified().await;

    let upload_id = uploader.session_id().expect("session should be open");
    assert_eq!(uploader.phase(), UploadPhase::Uploading);
    assert!(matches!(uploader.start().await, Err(ClientError::Busy)));

    uploader.cancel().await.unwrap();
    assert_eq!(task.await.unwrap().unwrap(), UploadOutcome::Aborted);

    assert_eq!(uploader.phase(), UploadPhase::Aborted);
    assert!(uploader.session_id().is_none());
    assert_eq!(api.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(api.completes.load(Ordering::SeqCst), 0);

    let status = backend
        .coordinator()
        .status(&alice(), upload_id)
        .await
        .unwrap();
    assert_eq!(status.state, UploadState::Aborted);
    let quota = backend.coordinator().quota_usage(&alice()).await.unwrap();
    assert_eq!(quota.reserved, 0);

    let events = events.lock().unwrap();
    assert!(events.contains(&UploadEvent::Aborted {
        upload_id: Some(upload_id)
    }));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, UploadEvent::Done { .. } | UploadEvent::Error { .. }))
    );
}

#[tokio::test]
async fn test_cancel_when_idle_is_a_no_op() {
    let backend = TestBackend::new().await;
    let path = backend.write_file("idle.bin", b"abc");
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    uploader.cancel().await.unwrap();
    assert_eq!(uploader.phase(), UploadPhase::Idle);
    assert_eq!(api.aborts.load(Ordering::SeqCst), 0);
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_chunk_failures_are_retried() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(9, 12);
    let path = backend.write_file("flaky.bin", &data);
    let api = CountingApi::with_hook(backend.api("alice"), Unavailable::new(&[(1, 2)]));
    let uploader = uploader(api.clone(), path);

    assert!(matches!(
        uploader.start().await.unwrap(),
        UploadOutcome::Completed(_)
    ));
    assert_eq!(writes_of(&api, 1), 3);
    assert_eq!(writes_of(&api, 0), 1);
}

#[tokio::test]
async fn test_retries_exhausted_surface_error_and_keep_session() {
    let backend = TestBackend::new().await;
    // A single chunk, so nothing else is in flight when the upload fails.
    let data = seeded_bytes(10, 4);
    let path = backend.write_file("down.bin", &data);
    let api = CountingApi::with_hook(backend.api("alice"), Unavailable::new(&[(0, 10)]));
    let uploader = uploader(api.clone(), path.clone());
    let events = record(&uploader);

    let err = uploader.start().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(writes_of(&api, 0), 4);
    assert_eq!(uploader.phase(), UploadPhase::Error);

    let upload_id = uploader.session_id().expect("session kept for resume");
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        UploadEvent::Error { upload_id: Some(id), .. } if *id == upload_id
    )));

    // Once the outage is over the same session can be resumed.
    let healthy = CountingApi::new(backend.api("alice"));
    let retry = Uploader::new(healthy.clone(), path, fast_options());
    assert!(matches!(
        retry.resume(upload_id).await.unwrap(),
        UploadOutcome::Completed(_)
    ));
    assert_eq!(healthy.written_indices(), vec![0]);
}

#[tokio::test]
async fn test_damaged_chunk_is_resent() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(11, 12);
    let path = backend.write_file("damaged.bin", &data);
    let api = CountingApi::with_hook(backend.api("alice"), DamageInTransit::new(1));
    let uploader = uploader(api.clone(), path);

    assert!(matches!(
        uploader.start().await.unwrap(),
        UploadOutcome::Completed(_)
    ));
    assert_eq!(writes_of(&api, 1), 2);
    assert_eq!(api.completes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completion_mismatch_reuploads_flagged_chunks() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(12, 12);
    let path = backend.write_file("corrupt.bin", &data);
    let hook = CorruptBeforeComplete::new(backend.memory.clone(), 1, 4);
    let api = CountingApi::with_hook(backend.api("alice"), hook);
    let uploader = uploader(api.clone(), path);

    let UploadOutcome::Completed(response) = uploader.start().await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(api.completes.load(Ordering::SeqCst), 2);
    assert_eq!(writes_of(&api, 0), 1);
    assert_eq!(writes_of(&api, 1), 2);
    assert_eq!(writes_of(&api, 2), 1);

    let stored = backend
        .memory
        .read_all(&format!("uploads/{}", response.upload_id))
        .await
        .unwrap();
    assert_eq!(&stored[..], &data[..]);
}

#[tokio::test]
async fn test_wrong_file_hash_aborts_session() {
    let backend = TestBackend::new().await;
    let data = seeded_bytes(17, 12);
    let path = backend.write_file("mislabeled.bin", &data);
    let api = CountingApi::with_hook(backend.api("alice"), WrongFileHash::new());
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    let err = uploader.start().await.unwrap_err();
    assert!(err.is_chunk_checksum_mismatch());
    assert!(err.mismatched_chunks().is_empty());
    assert_eq!(api.completes.load(Ordering::SeqCst), 1);
    assert_eq!(api.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(api.write_count(), 3);
    assert_eq!(uploader.phase(), UploadPhase::Error);
    assert!(uploader.session_id().is_none());

    let events = events.lock().unwrap();
    assert_eq!(phases(&events).last(), Some(&UploadPhase::Error));
    assert!(events.iter().any(|event| matches!(
        event,
        UploadEvent::Error { code: Some(code), upload_id: None, .. }
            if code == "checksum_mismatch"
    )));

    let listed = backend.coordinator().list_ongoing(&alice()).await.unwrap();
    assert!(listed.uploads.is_empty());
    let quota = backend.coordinator().quota_usage(&alice()).await.unwrap();
    assert_eq!(quota.reserved, 0);
}

#[tokio::test]
async fn test_quota_exceeded_is_not_retried() {
    let backend = TestBackend::with_config(|c| c.quota.default_limit_bytes = 5).await;
    let path = backend.write_file("big.bin", &seeded_bytes(13, 10));
    let api = CountingApi::new(backend.api("alice"));
    let uploader = uploader(api.clone(), path);
    let events = record(&uploader);

    let err = uploader.start().await.unwrap_err();
    assert_eq!(err.code(), Some("quota_exceeded"));
    assert_eq!(api.inits.load(Ordering::SeqCst), 1);
    assert_eq!(api.write_count(), 0);
    assert!(uploader.session_id().is_none());

    let events = events.lock().unwrap();
    assert_eq!(
        phases(&events),
        vec![UploadPhase::Hashing, UploadPhase::Error]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        UploadEvent::Error { code: Some(code), upload_id: None, .. } if code == "quota_exceeded"
    )));
}

#[tokio::test]
async fn test_uploader_can_run_again_after_error() {
    let backend = TestBackend::new().await;
    let path = backend.write_file("again.bin", &seeded_bytes(14, 8));
    let api = CountingApi::with_hook(backend.api("alice"), Unavailable::new(&[(0, 4)]));
    let uploader = uploader(api.clone(), path);

    assert!(uploader.start().await.is_err());
    assert!(matches!(
        uploader.start().await.unwrap(),
        UploadOutcome::Completed(_)
    ));
    assert_eq!(api.inits.load(Ordering::SeqCst), 2);
}

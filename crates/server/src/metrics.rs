//! Prometheus metrics for the ferry server.
//!
//! Counters cover the session lifecycle, chunk traffic and the cleanup
//! reaper. The `/metrics` endpoint is unauthenticated so it should only be
//! reachable from the scraper's network.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session lifecycle
pub static UPLOADS_INITIATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_initiated_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_completed_total",
        "Total number of upload sessions completed",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_aborted_total",
        "Total number of upload sessions aborted by their owner",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_expired_total",
        "Total number of upload sessions that expired",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_UPLOAD_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "ferry_active_upload_sessions",
        "Live upload sessions seen by the last reaper run",
    )
    .expect("metric creation failed")
});

// Chunk traffic
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_chunks_received_total",
        "Total number of chunks accepted (first acceptance only)",
    )
    .expect("metric creation failed")
});

pub static CHUNK_BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_chunk_bytes_received_total",
        "Total chunk bytes written to the chunk store",
    )
    .expect("metric creation failed")
});

pub static CHUNK_CHECKSUM_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_chunk_checksum_failures_total",
        "Total number of chunk or file checksum verification failures",
    )
    .expect("metric creation failed")
});

pub static COMPLETE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "ferry_complete_duration_seconds",
            "Time taken to verify and complete an upload session",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("ferry_upload_errors_total", "Total upload errors by error code"),
        &["code"],
    )
    .expect("metric creation failed")
});

// Cleanup reaper
pub static REAPER_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("ferry_reaper_runs_total", "Total number of reaper runs")
        .expect("metric creation failed")
});

pub static REAPER_ORPHANS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_reaper_orphans_deleted_total",
        "Total number of orphaned chunk store files deleted",
    )
    .expect("metric creation failed")
});

pub static REAPER_BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_reaper_bytes_reclaimed_total",
        "Total bytes reclaimed by the reaper",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS_INITIATED.clone()),
            Box::new(UPLOADS_COMPLETED.clone()),
            Box::new(UPLOADS_ABORTED.clone()),
            Box::new(UPLOADS_EXPIRED.clone()),
            Box::new(ACTIVE_UPLOAD_SESSIONS.clone()),
            Box::new(CHUNKS_RECEIVED.clone()),
            Box::new(CHUNK_BYTES_RECEIVED.clone()),
            Box::new(CHUNK_CHECKSUM_FAILURES.clone()),
            Box::new(COMPLETE_DURATION.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(REAPER_RUNS.clone()),
            Box::new(REAPER_ORPHANS_DELETED.clone()),
            Box::new(REAPER_BYTES_RECLAIMED.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record upload errors by code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
}

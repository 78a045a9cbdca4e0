//! Prometheus metrics helpers for the Quill pipeline.
//!
//! This module provides centralized metrics initialization and common metric
//! definitions used across Quill components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use quill_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::counter;
//!     counter!("gateway_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`gateway_`, `normalize_`, `dedupe_`, `batch_`,
//!   `index_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: use sparingly to avoid cardinality explosion

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port.
/// This spawns a background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for common metrics used across Quill.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Gateway / Event Consumer Metrics
    // =========================================================================

    describe_counter!(
        "gateway_events_total",
        "Total events received from the upstream gateway"
    );
    describe_counter!(
        "gateway_decode_errors_total",
        "Events that failed to decode and were skipped"
    );
    describe_counter!(
        "gateway_reconnects_total",
        "Reconnection attempts to the upstream gateway"
    );
    describe_counter!(
        "gateway_resyncs_total",
        "Full resyncs performed because the gateway could not resume"
    );
    describe_gauge!(
        "gateway_connected",
        "Whether the gateway connection is established (1=yes, 0=no)"
    );

    // =========================================================================
    // Normalizer Metrics
    // =========================================================================

    describe_counter!(
        "normalize_records_total",
        "Events successfully normalized into records"
    );
    describe_counter!(
        "normalize_dropped_total",
        "Events dropped by the normalizer (empty or unrecognized payload)"
    );

    // =========================================================================
    // Dedup Cache Metrics
    // =========================================================================

    describe_counter!("dedupe_lookups_total", "Total dedup cache lookups");
    describe_counter!(
        "dedupe_hits_total",
        "Dedup cache hits (stale or duplicate records suppressed)"
    );
    describe_gauge!("dedupe_entries", "Entries currently in the dedup cache");

    // =========================================================================
    // Batcher Metrics
    // =========================================================================

    describe_counter!(
        "batch_flush_total",
        "Batches flushed to the index writer (label: reason)"
    );
    describe_counter!("batch_records_total", "Records accepted into batches");
    describe_gauge!("batch_open_records", "Records in the current open batch");

    // =========================================================================
    // Index Writer Metrics
    // =========================================================================

    describe_counter!(
        "index_records_upserted_total",
        "Records upserted into the search index"
    );
    describe_counter!(
        "index_records_deleted_total",
        "Tombstone deletes applied to the search index"
    );
    describe_counter!(
        "index_records_dropped_total",
        "Records dropped due to permanent per-record failures"
    );
    describe_counter!(
        "index_retries_total",
        "Whole-batch retries due to transient index failures"
    );
    describe_counter!(
        "index_batches_failed_total",
        "Batches that exhausted their retry budget"
    );
    describe_counter!(
        "index_batches_abandoned_total",
        "Requeued batches that failed a second time and were abandoned"
    );
    describe_histogram!(
        "index_commit_duration_seconds",
        "Time spent committing a batch to the search index"
    );
    describe_gauge!(
        "ingestion_running",
        "Whether the ingestion daemon is running (1=yes, 0=no)"
    );
}

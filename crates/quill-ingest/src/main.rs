//! Quill ingestion daemon.
//!
//! This is the main entry point for the chat-to-search ingestion service.
//! It consumes message events from an upstream gateway, normalizes and
//! deduplicates them, and commits batches to the hosted search index.
//!
//! # Usage
//!
//! ```bash
//! # Replay an event file into a local search service
//! quill-ingest \
//!     --events-file ./events.jsonl \
//!     --backend-url http://localhost:8108 \
//!     --application-id quill --api-key dev-key
//!
//! # Tune batching for a bulk backfill
//! quill-ingest --events-file ./backfill.jsonl \
//!     --batch-size 500 --batch-age-ms 5000
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) for graceful shutdown:
//! 1. Stops consuming new events from the gateway
//! 2. Flushes the partial open batch
//! 3. Drains in-flight batches to the index, bounded by the drain timeout
//! 4. Exits cleanly with a run summary

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use quill_core::metrics::{init_metrics, start_metrics_server};
use quill_ingest::{
    pipeline, BatchConfig, ConsumerConfig, DedupConfig, HttpIndexConfig, HttpSearchIndex,
    JsonlConfig, JsonlGateway, PipelineConfig, RuntimeConfig, Shutdown, WriterConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Quill ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "quill-ingest")]
#[command(about = "Chat message to search index ingestion daemon")]
#[command(version)]
struct Args {
    /// JSONL event file to replay
    #[arg(long)]
    events_file: PathBuf,

    /// Base URL of the search service
    #[arg(long, default_value = "http://localhost:8108")]
    backend_url: String,

    /// Search service application id
    #[arg(long, env = "QUILL_APPLICATION_ID")]
    application_id: String,

    /// Search service write API key
    #[arg(long, env = "QUILL_API_KEY")]
    api_key: String,

    /// Destination index name
    #[arg(long, default_value = "messages")]
    index: String,

    /// Maximum records per batch
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Maximum batch age in milliseconds before a flush
    #[arg(long, default_value = "2000")]
    batch_age_ms: u64,

    /// Dedup cache capacity (entries)
    #[arg(long, default_value = "100000")]
    cache_capacity: u64,

    /// Dedup cache TTL in seconds (0 to disable expiry)
    #[arg(long, default_value = "86400")]
    cache_ttl_secs: u64,

    /// Total index commit attempts per batch
    #[arg(long, default_value = "5")]
    max_attempts: u32,

    /// Number of concurrent commit workers
    #[arg(long, default_value = "2")]
    commit_concurrency: usize,

    /// Raw event queue capacity
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,

    /// Shutdown drain timeout in seconds
    #[arg(long, default_value = "30")]
    drain_timeout_secs: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("quill_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Quill ingestion daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("ingestion_running").set(1.0);
        tracing::info!("Metrics server listening on port {}", args.metrics_port);
    }

    // Set up graceful shutdown
    let shutdown = Shutdown::new();
    let shutdown_clone = Arc::clone(&shutdown);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        shutdown_clone.trigger();
    })
    .context("Failed to set Ctrl+C handler")?;

    let config = PipelineConfig {
        consumer: ConsumerConfig::default(),
        dedupe: DedupConfig {
            capacity: args.cache_capacity,
            ttl: (args.cache_ttl_secs > 0).then(|| Duration::from_secs(args.cache_ttl_secs)),
        },
        batch: BatchConfig {
            max_batch_size: args.batch_size,
            max_batch_age: Duration::from_millis(args.batch_age_ms),
            destination_index: args.index.clone(),
        },
        writer: WriterConfig {
            max_attempts: args.max_attempts,
            ..Default::default()
        },
        runtime: RuntimeConfig {
            queue_capacity: args.queue_capacity,
            commit_concurrency: args.commit_concurrency,
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            ..Default::default()
        },
    };

    tracing::info!("Configuration:");
    tracing::info!("  Events file: {}", args.events_file.display());
    tracing::info!("  Backend: {}", args.backend_url);
    tracing::info!("  Index: {}", args.index);
    tracing::info!(
        "  Batching: {} records / {} ms",
        args.batch_size,
        args.batch_age_ms
    );
    tracing::info!(
        "  Dedup cache: {} entries, ttl {}s",
        args.cache_capacity,
        args.cache_ttl_secs
    );
    tracing::info!("  Commit workers: {}", args.commit_concurrency);

    let gateway = JsonlGateway::new(JsonlConfig {
        input: args.events_file.clone(),
    });
    let backend = Arc::new(
        HttpSearchIndex::new(HttpIndexConfig {
            base_url: args.backend_url.clone(),
            application_id: args.application_id.clone(),
            api_key: args.api_key.clone(),
            ..Default::default()
        })
        .context("Failed to create search index client")?,
    );

    tracing::info!("Starting ingestion...");
    let summary = pipeline::run(gateway, backend, config, Arc::clone(&shutdown))
        .await
        .context("Pipeline failed")?;

    // Mark as stopped
    gauge!("ingestion_running").set(0.0);

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events received:      {}", summary.source.total_events);
    tracing::info!("Decode errors:        {}", summary.source.decode_errors);
    tracing::info!("Gateway reconnects:   {}", summary.source.reconnects);
    tracing::info!("Records normalized:   {}", summary.normalized);
    tracing::info!("Events dropped:       {}", summary.normalize_dropped);
    tracing::info!("Duplicates suppressed:{}", summary.dedupe.hits);
    tracing::info!("Batches flushed:      {}", summary.batches.flushes);
    tracing::info!("Records upserted:     {}", summary.writer.records_upserted);
    tracing::info!("Records deleted:      {}", summary.writer.records_deleted);
    tracing::info!("Records dropped:      {}", summary.writer.records_dropped);
    tracing::info!("Commit retries:       {}", summary.writer.retries);
    tracing::info!("Batches abandoned:    {}", summary.writer.batches_abandoned);

    Ok(())
}

//! Ingestion pipeline.
//!
//! Wires the stages together and runs them to completion:
//!
//! ```text
//! consumer ──▶ bounded queue ──▶ normalize ──▶ dedup ──▶ batcher
//!                                                           │
//!                                              flush queue  ▼
//!                                  commit workers ◀─────────┘
//!                                        │
//!                                        ▼
//!                                  search index
//! ```
//!
//! The consumer runs as its own task; normalization and dedup run inline
//! on the queue between them, and a small pool of commit workers pulls
//! full batches off the flush queue. Both queues are bounded, so a slow
//! index backpressures all the way to the gateway.
//!
//! Commit workers run concurrently, so two batches carrying different
//! versions of the same document can reach the backend out of order. The
//! upsert body carries the record version for exactly this reason:
//! deployments running more than one worker should enable the backend's
//! version check so the index enforces last-writer-wins across batches.
//!
//! On shutdown the pipeline drains in order: consumer first, then a final
//! partial-batch flush, then the commit workers, bounded by
//! `drain_timeout`.

mod batch;
mod dedupe;
mod http;
mod index;

pub use batch::{Batch, BatchConfig, BatchStats, Batcher};
pub use dedupe::{DedupCache, DedupConfig, DedupeStats};
pub use http::{HttpIndexConfig, HttpSearchIndex};
pub use index::{
    BatchReport, CommitOutcome, DroppedRecord, IndexWriter, SearchIndex, WriterConfig, WriterStats,
};

use crate::shutdown::Shutdown;
use crate::source::{ConsumerConfig, EventConsumer, Gateway, SourceStats};
use crate::{Error, Result};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Gateway consumer settings.
    pub consumer: ConsumerConfig,

    /// Dedup cache bounds.
    pub dedupe: DedupConfig,

    /// Batching bounds and destination index.
    pub batch: BatchConfig,

    /// Index writer retry policy.
    pub writer: WriterConfig,

    /// Pipeline channel sizes and worker counts.
    pub runtime: RuntimeConfig,
}

/// Channel sizes, worker counts and shutdown bounds.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the raw event queue between consumer and normalizer.
    pub queue_capacity: usize,

    /// Capacity of the flush queue between batcher and commit workers.
    pub flush_queue: usize,

    /// Number of concurrent commit workers.
    pub commit_concurrency: usize,

    /// Upper bound on draining in-flight batches at shutdown.
    pub drain_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            flush_queue: 8,
            commit_concurrency: 2,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Final statistics from a completed pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    /// Gateway consumer statistics.
    pub source: SourceStats,

    /// Records produced by normalization.
    pub normalized: u64,

    /// Events dropped by normalization (empty or unrecognized payloads).
    pub normalize_dropped: u64,

    /// Dedup cache statistics.
    pub dedupe: DedupeStats,

    /// Batcher statistics.
    pub batches: BatchStats,

    /// Index writer statistics.
    pub writer: WriterStats,
}

/// Run the pipeline until the source ends, a fatal error occurs, or
/// `shutdown` triggers.
///
/// Returns the run's statistics on success; fatal gateway or index errors
/// surface as `Err` after a bounded drain of in-flight work.
pub async fn run<G>(
    gateway: G,
    backend: Arc<dyn SearchIndex>,
    config: PipelineConfig,
    shutdown: Arc<Shutdown>,
) -> Result<PipelineSummary>
where
    G: Gateway + 'static,
{
    let (event_tx, mut event_rx) = mpsc::channel(config.runtime.queue_capacity.max(1));
    let (flush_tx, flush_rx) = mpsc::channel(config.runtime.flush_queue.max(1));

    let dedupe = Arc::new(DedupCache::new(config.dedupe));
    let batcher = Arc::new(Batcher::new(config.batch, flush_tx));
    let writer = Arc::new(IndexWriter::new(backend, config.writer));
    let fatal: Arc<parking_lot::Mutex<Option<Error>>> = Arc::new(parking_lot::Mutex::new(None));

    let consumer = EventConsumer::new(gateway, config.consumer, Arc::clone(&shutdown));
    let consumer_task = tokio::spawn(async move { consumer.run(event_tx).await });

    let flusher_stop = Shutdown::new();
    let flusher_task =
        tokio::spawn(Arc::clone(&batcher).run_age_flusher(Arc::clone(&flusher_stop)));

    // Workers share one receiver; whichever is idle picks up the next batch
    let flush_rx = Arc::new(tokio::sync::Mutex::new(flush_rx));
    let mut workers = Vec::new();
    for worker_id in 0..config.runtime.commit_concurrency.max(1) {
        workers.push(tokio::spawn(commit_worker(
            worker_id,
            Arc::clone(&flush_rx),
            Arc::clone(&writer),
            Arc::clone(&batcher),
            Arc::clone(&dedupe),
            Arc::clone(&fatal),
            Arc::clone(&shutdown),
        )));
    }

    // Normalize and dedup inline on the event queue
    let mut normalized = 0u64;
    let mut normalize_dropped = 0u64;
    while let Some(event) = event_rx.recv().await {
        if fatal.lock().is_some() {
            break;
        }

        match quill_core::normalize(&event) {
            Some(record) => {
                if dedupe.should_process(&record) {
                    normalized += 1;
                    counter!("normalize_records_total").increment(1);
                    if batcher.add(record).await.is_err() {
                        break;
                    }
                }
            }
            None => {
                normalize_dropped += 1;
                counter!("normalize_dropped_total").increment(1);
                tracing::debug!(
                    channel_id = %event.channel_id,
                    message_id = %event.message_id,
                    "dropping event with no indexable text"
                );
            }
        }
    }
    drop(event_rx);

    let source_result = consumer_task
        .await
        .map_err(|e| Error::Gateway(format!("consumer task panicked: {e}")))?;

    // Drain: final partial flush, close the flush channel, let workers finish
    if let Err(e) = batcher.drain().await {
        tracing::warn!(error = %e, "final flush failed");
    }
    flusher_stop.trigger();

    let drained = tokio::time::timeout(config.runtime.drain_timeout, async {
        for worker in &mut workers {
            let _ = worker.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = config.runtime.drain_timeout.as_secs(),
            "drain timeout exceeded, abandoning in-flight batches"
        );
        for worker in &workers {
            worker.abort();
        }
    }
    let _ = flusher_task.await;

    if let Some(e) = fatal.lock().take() {
        return Err(e);
    }
    let source = source_result?;

    Ok(PipelineSummary {
        source,
        normalized,
        normalize_dropped,
        dedupe: dedupe.stats(),
        batches: batcher.stats(),
        writer: writer.stats(),
    })
}

/// One commit worker: pulls batches off the shared flush queue and commits
/// them, updating the dedup cache on success and requeueing on exhaustion.
async fn commit_worker(
    worker_id: usize,
    flush_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    writer: Arc<IndexWriter>,
    batcher: Arc<Batcher>,
    dedupe: Arc<DedupCache>,
    fatal: Arc<parking_lot::Mutex<Option<Error>>>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        let batch = { flush_rx.lock().await.recv().await };
        let Some(batch) = batch else {
            tracing::debug!(worker_id, "flush channel drained, worker exiting");
            return;
        };

        if fatal.lock().is_some() {
            tracing::warn!(
                worker_id,
                records = batch.records.len(),
                "discarding batch after fatal error"
            );
            continue;
        }

        match writer.commit(&batch).await {
            Ok(CommitOutcome::Committed(report)) => {
                let dropped: HashSet<&str> = report.dropped.iter().map(|d| d.id.as_str()).collect();
                for record in &batch.records {
                    if !dropped.contains(record.id.as_str()) {
                        dedupe.commit(record);
                    }
                }
            }
            Ok(CommitOutcome::Exhausted) => {
                // Requeue from a separate task: the flush queue may be full,
                // and this worker must get back to consuming it.
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move {
                    let count = batch.records.len();
                    if batcher.requeue(batch.records).await.is_err() {
                        tracing::error!(records = count, "cannot requeue after drain, abandoning batch");
                    }
                });
            }
            Ok(CommitOutcome::Abandoned) => {}
            Err(e) => {
                tracing::error!(worker_id, error = %e, "fatal index failure, stopping pipeline");
                let mut slot = fatal.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
                drop(slot);
                shutdown.trigger();
            }
        }
    }
}

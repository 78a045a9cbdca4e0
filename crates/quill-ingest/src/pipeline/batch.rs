//! Record batcher.
//!
//! This module provides the [`Batcher`], which accumulates normalized
//! records into one open batch per destination index and hands full batches
//! to the commit workers over a bounded channel.
//!
//! # Flushing
//!
//! A batch is flushed when it reaches `max_batch_size`, or when the oldest
//! record in it exceeds `max_batch_age` (checked by a background ticker),
//! whichever comes first. The open batch is replaced immediately on flush,
//! so new `add` calls never wait for a commit. They only wait when the
//! flush channel itself is full, which is the pipeline's backpressure
//! point toward the index.
//!
//! On shutdown, [`drain`](Batcher::drain) flushes any partial batch and
//! closes the channel so commit workers can finish and exit.

use crate::shutdown::Shutdown;
use crate::{Error, Result};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use quill_core::Record;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Configuration for the batcher.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum records per batch.
    pub max_batch_size: usize,

    /// Maximum age of the oldest unflushed record before a flush.
    pub max_batch_age: Duration,

    /// Name of the destination search index.
    pub destination_index: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_age: Duration::from_secs(2),
            destination_index: "messages".to_string(),
        }
    }
}

/// An ordered batch of records bound for one destination index.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Destination search index name.
    pub destination_index: String,

    /// Records in arrival order.
    pub records: Vec<Record>,

    /// Set when this batch already exhausted one retry budget and was
    /// force-requeued; a second exhaustion abandons it.
    pub requeued: bool,
}

struct OpenBatch {
    records: Vec<Record>,
    opened_at: Instant,
}

/// Accumulates records into bounded batches.
///
/// Thread-safe: `add` may be called concurrently; the open batch sits
/// behind a single mutex per destination index.
pub struct Batcher {
    config: BatchConfig,
    open: Mutex<Option<OpenBatch>>,
    flush_tx: Mutex<Option<mpsc::Sender<Batch>>>,
    flushes: AtomicU64,
    records_total: AtomicU64,
}

impl Batcher {
    /// Create a new batcher feeding the given flush channel.
    pub fn new(config: BatchConfig, flush_tx: mpsc::Sender<Batch>) -> Self {
        Self {
            config,
            open: Mutex::new(None),
            flush_tx: Mutex::new(Some(flush_tx)),
            flushes: AtomicU64::new(0),
            records_total: AtomicU64::new(0),
        }
    }

    /// Add a record to the open batch, flushing if the size bound is hit.
    pub async fn add(&self, record: Record) -> Result<()> {
        self.records_total.fetch_add(1, Ordering::Relaxed);
        counter!("batch_records_total").increment(1);

        let full = {
            let mut open = self.open.lock();
            let batch = open.get_or_insert_with(|| OpenBatch {
                records: Vec::with_capacity(self.config.max_batch_size),
                opened_at: Instant::now(),
            });
            batch.records.push(record);
            gauge!("batch_open_records").set(batch.records.len() as f64);

            if batch.records.len() >= self.config.max_batch_size {
                open.take()
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.send("size", batch.records, false).await?;
        }
        Ok(())
    }

    /// Flush the open batch if its oldest record exceeds the age bound.
    pub async fn flush_if_aged(&self) -> Result<()> {
        let aged = {
            let mut open = self.open.lock();
            let is_aged = open
                .as_ref()
                .is_some_and(|b| b.opened_at.elapsed() >= self.config.max_batch_age);
            if is_aged {
                open.take()
            } else {
                None
            }
        };

        if let Some(batch) = aged {
            self.send("age", batch.records, false).await?;
        }
        Ok(())
    }

    /// Background ticker driving age-based flushes.
    ///
    /// Checks at a quarter of the age bound so a flush lands within
    /// ~1.25x `max_batch_age` of the first add. Each tick is raced against
    /// `stop`, so the flusher exits promptly on shutdown rather than
    /// finishing a sleep first.
    pub async fn run_age_flusher(self: Arc<Self>, stop: Arc<Shutdown>) {
        let tick = (self.config.max_batch_age / 4).max(Duration::from_millis(10));
        while !stop.is_triggered() {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.flush_if_aged().await {
                        tracing::debug!(error = %e, "age flush skipped, channel closed");
                        return;
                    }
                }
                _ = stop.wait() => return,
            }
        }
    }

    /// Re-enqueue records from a failed batch, bypassing the dedup cache.
    ///
    /// The resulting batch is marked requeued so the index writer abandons
    /// it instead of requeueing again on a second exhaustion.
    pub async fn requeue(&self, records: Vec<Record>) -> Result<()> {
        self.send("requeue", records, true).await
    }

    /// Final flush on shutdown; closes the flush channel afterwards so the
    /// commit workers drain and exit.
    pub async fn drain(&self) -> Result<()> {
        let remaining = self.open.lock().take();
        if let Some(batch) = remaining {
            self.send("drain", batch.records, false).await?;
        }
        *self.flush_tx.lock() = None;
        Ok(())
    }

    async fn send(&self, reason: &'static str, records: Vec<Record>, requeued: bool) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let sender = self.flush_tx.lock().clone().ok_or(Error::ChannelClosed)?;

        self.flushes.fetch_add(1, Ordering::Relaxed);
        counter!("batch_flush_total", "reason" => reason).increment(1);
        gauge!("batch_open_records").set(0.0);
        tracing::debug!(reason, records = records.len(), "flushing batch");

        sender
            .send(Batch {
                destination_index: self.config.destination_index.clone(),
                records,
                requeued,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Get statistics about the batcher.
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            records: self.records_total.load(Ordering::Relaxed),
            open_records: self.open.lock().as_ref().map(|b| b.records.len()).unwrap_or(0),
        }
    }
}

/// Statistics about the batcher.
#[derive(Debug, Clone)]
pub struct BatchStats {
    /// Batches flushed (all reasons).
    pub flushes: u64,

    /// Records accepted.
    pub records: u64,

    /// Records in the current open batch.
    pub open_records: usize,
}

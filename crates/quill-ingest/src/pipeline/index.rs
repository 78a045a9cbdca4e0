//! Index writer.
//!
//! This module provides the [`SearchIndex`] seam to the external search
//! backend and the [`IndexWriter`] that commits batches through it.
//!
//! # Commit semantics
//!
//! Each batch is collapsed per document id before it is sent, keeping the
//! highest version seen for the id. The dedup cache cannot suppress a
//! stale redelivery whose newer sibling sits uncommitted in the same
//! batch, so the collapse has to pick by version, not arrival order. A
//! delete can therefore never net-delete content from a newer upsert in
//! the same batch, whatever order the backend applies the two operation
//! sets in.
//!
//! # Failure handling
//!
//! - Transient failures (rate limit, timeout, 5xx) retry the whole batch
//!   with capped exponential backoff, carried as explicit per-batch state.
//! - Permanent per-record failures (4xx validation) drop the offending
//!   record and let its siblings proceed.
//! - A batch that exhausts its retry budget is handed back for one forced
//!   requeue; a requeued batch that fails again is abandoned with a
//!   persistent-failure log.

use super::batch::Batch;
use crate::Result;
use async_trait::async_trait;
use metrics::{counter, histogram};
use quill_core::Record;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A record the backend rejected permanently.
#[derive(Debug, Clone)]
pub struct DroppedRecord {
    /// Document id of the rejected record.
    pub id: String,
    /// Backend-provided reason.
    pub reason: String,
}

/// Per-batch result reported by a [`SearchIndex`].
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Records successfully upserted.
    pub upserted: usize,

    /// Delete operations successfully applied (deleting an absent id
    /// counts as success).
    pub deleted: usize,

    /// Records rejected permanently; siblings still proceeded.
    pub dropped: Vec<DroppedRecord>,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.dropped.extend(other.dropped);
    }
}

/// External search index backend.
///
/// The pipeline only depends on batched upserts and deletes with
/// per-record statuses. Transient whole-call failures surface as
/// [`Error::IndexTransient`], credential/index problems as
/// [`Error::IndexFatal`].
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Whether the backend accepts mixed upsert/delete operations in a
    /// single batch call.
    fn supports_mixed_batch(&self) -> bool {
        false
    }

    /// Upsert a batch of records, keyed by `Record::id`.
    async fn upsert_batch(&self, index: &str, records: &[Record]) -> Result<BatchReport>;

    /// Delete a batch of document ids. Absent ids are a no-op, not an
    /// error.
    async fn delete_batch(&self, index: &str, ids: &[String]) -> Result<BatchReport>;

    /// Apply upserts and deletes together.
    ///
    /// The default issues two sequential calls (upserts, then deletes);
    /// backends with a mixed-operation batch endpoint override this with
    /// a single network call.
    async fn apply_batch(
        &self,
        index: &str,
        upserts: &[Record],
        deletes: &[String],
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if !upserts.is_empty() {
            report.merge(self.upsert_batch(index, upserts).await?);
        }
        if !deletes.is_empty() {
            report.merge(self.delete_batch(index, deletes).await?);
        }
        Ok(report)
    }
}

/// Configuration for the index writer's retry policy.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Total attempts per batch (first try included).
    pub max_attempts: u32,

    /// First retry delay.
    pub initial_backoff: Duration,

    /// Ceiling for the retry delay.
    pub max_backoff: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Explicit retry state carried per batch, so the commit workers stay
/// bounded and cancellable.
struct RetryState {
    attempt: u32,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryState {
    fn new(config: &WriterConfig) -> Self {
        Self {
            attempt: 1,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Advance to the next attempt and return the delay before it.
    fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.saturating_sub(1).min(16);
        self.attempt += 1;
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let factor = rand::thread_rng().gen_range(0.5..1.0);
        base.mul_f64(factor)
    }
}

/// Outcome of committing one batch.
#[derive(Debug)]
pub enum CommitOutcome {
    /// The batch was applied; dropped records (if any) are in the report.
    Committed(BatchReport),

    /// Retry budget exhausted; the caller should force-requeue the batch
    /// once through the dedup cache bypass.
    Exhausted,

    /// A requeued batch failed again; its records are abandoned.
    Abandoned,
}

/// Commits batches to a [`SearchIndex`] with retry and partial-failure
/// handling.
pub struct IndexWriter {
    backend: Arc<dyn SearchIndex>,
    config: WriterConfig,
    batches_committed: AtomicU64,
    records_upserted: AtomicU64,
    records_deleted: AtomicU64,
    records_dropped: AtomicU64,
    retries: AtomicU64,
    batches_failed: AtomicU64,
    batches_abandoned: AtomicU64,
}

impl IndexWriter {
    /// Create a new writer over the given backend.
    pub fn new(backend: Arc<dyn SearchIndex>, config: WriterConfig) -> Self {
        tracing::info!(
            max_attempts = config.max_attempts,
            mixed_batches = backend.supports_mixed_batch(),
            "index writer initialized"
        );
        Self {
            backend,
            config,
            batches_committed: AtomicU64::new(0),
            records_upserted: AtomicU64::new(0),
            records_deleted: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_abandoned: AtomicU64::new(0),
        }
    }

    /// Commit one batch.
    ///
    /// Returns `Err` only for fatal backend failures (bad credentials,
    /// missing index); everything else resolves to a [`CommitOutcome`].
    pub async fn commit(&self, batch: &Batch) -> Result<CommitOutcome> {
        let (upserts, deletes) = collapse(&batch.records);
        let index = batch.destination_index.as_str();

        let mut retry = RetryState::new(&self.config);
        loop {
            let started = Instant::now();
            let result = self.backend.apply_batch(index, &upserts, &deletes).await;
            histogram!("index_commit_duration_seconds").record(started.elapsed().as_secs_f64());

            match result {
                Ok(report) => {
                    self.record_report(&report);
                    for dropped in &report.dropped {
                        tracing::warn!(
                            id = %dropped.id,
                            reason = %dropped.reason,
                            "record rejected by index, dropping"
                        );
                    }
                    self.batches_committed.fetch_add(1, Ordering::Relaxed);
                    return Ok(CommitOutcome::Committed(report));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_transient() => {
                    if retry.exhausted() {
                        self.batches_failed.fetch_add(1, Ordering::Relaxed);
                        counter!("index_batches_failed_total").increment(1);

                        if batch.requeued {
                            self.batches_abandoned.fetch_add(1, Ordering::Relaxed);
                            counter!("index_batches_abandoned_total").increment(1);
                            tracing::error!(
                                records = batch.records.len(),
                                error = %e,
                                "requeued batch failed again, abandoning records"
                            );
                            return Ok(CommitOutcome::Abandoned);
                        }

                        tracing::warn!(
                            records = batch.records.len(),
                            attempts = retry.attempt,
                            error = %e,
                            "batch retry budget exhausted, requeueing"
                        );
                        return Ok(CommitOutcome::Exhausted);
                    }

                    let delay = retry.next_delay();
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    counter!("index_retries_total").increment(1);
                    tracing::warn!(
                        attempt = retry.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient index failure, retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Whole-call permanent rejection: nothing in this batch
                    // can be applied, but siblings in other batches are fine.
                    tracing::error!(
                        records = batch.records.len(),
                        error = %e,
                        "index rejected batch permanently, dropping records"
                    );
                    let report = BatchReport {
                        dropped: batch
                            .records
                            .iter()
                            .map(|r| DroppedRecord {
                                id: r.id.clone(),
                                reason: e.to_string(),
                            })
                            .collect(),
                        ..Default::default()
                    };
                    self.record_report(&report);
                    return Ok(CommitOutcome::Committed(report));
                }
            }
        }
    }

    fn record_report(&self, report: &BatchReport) {
        self.records_upserted
            .fetch_add(report.upserted as u64, Ordering::Relaxed);
        self.records_deleted
            .fetch_add(report.deleted as u64, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(report.dropped.len() as u64, Ordering::Relaxed);
        counter!("index_records_upserted_total").increment(report.upserted as u64);
        counter!("index_records_deleted_total").increment(report.deleted as u64);
        counter!("index_records_dropped_total").increment(report.dropped.len() as u64);
    }

    /// Get statistics about the writer.
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            records_upserted: self.records_upserted.load(Ordering::Relaxed),
            records_deleted: self.records_deleted.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_abandoned: self.batches_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Collapse a batch per document id, keeping the highest version (ties go
/// to the later occurrence), and split it into upsert records and delete
/// ids.
fn collapse(records: &[Record]) -> (Vec<Record>, Vec<String>) {
    let mut order: Vec<&Record> = Vec::with_capacity(records.len());
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(records.len());

    for record in records {
        match index_of.get(record.id.as_str()) {
            Some(&i) => {
                if record.version >= order[i].version {
                    order[i] = record;
                }
            }
            None => {
                index_of.insert(record.id.as_str(), order.len());
                order.push(record);
            }
        }
    }

    let upserts = order
        .iter()
        .filter(|r| !r.tombstone)
        .map(|r| (*r).clone())
        .collect();
    let deletes = order
        .iter()
        .filter(|r| r.tombstone)
        .map(|r| r.id.clone())
        .collect();
    (upserts, deletes)
}

/// Statistics about the index writer.
#[derive(Debug, Clone)]
pub struct WriterStats {
    /// Batches applied (including partially dropped ones).
    pub batches_committed: u64,

    /// Records upserted.
    pub records_upserted: u64,

    /// Deletes applied.
    pub records_deleted: u64,

    /// Records dropped due to permanent failures.
    pub records_dropped: u64,

    /// Whole-batch transient retries.
    pub retries: u64,

    /// Batches that exhausted their retry budget.
    pub batches_failed: u64,

    /// Requeued batches abandoned after a second failure.
    pub batches_abandoned: u64,
}

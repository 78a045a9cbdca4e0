//! End-to-end pipeline tests: JSONL replay through normalization, dedup
//! and batching into an in-memory search index.

use async_trait::async_trait;
use parking_lot::Mutex;
use quill_core::{document_id, Record};
use quill_ingest::{
    pipeline, BatchConfig, BatchReport, ConsumerConfig, DedupConfig, DroppedRecord, JsonlConfig,
    JsonlGateway, PipelineConfig, PipelineSummary, Result, RuntimeConfig, SearchIndex, Shutdown,
    WriterConfig,
};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// In-memory search index with programmable transient failures.
#[derive(Default)]
struct FakeIndex {
    documents: Mutex<HashMap<String, (u64, String)>>,
    fail_transient: AtomicU32,
    fatal: AtomicBool,
}

impl FakeIndex {
    fn check_failures(&self) -> Result<()> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(quill_ingest::Error::IndexFatal(
                "index does not exist".to_string(),
            ));
        }
        if self.fail_transient.load(Ordering::SeqCst) > 0 {
            self.fail_transient.fetch_sub(1, Ordering::SeqCst);
            return Err(quill_ingest::Error::IndexTransient(
                "service unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn snapshot(&self) -> HashMap<String, (u64, String)> {
        self.documents.lock().clone()
    }
}

#[async_trait]
impl SearchIndex for FakeIndex {
    async fn upsert_batch(&self, _index: &str, records: &[Record]) -> Result<BatchReport> {
        self.check_failures()?;
        let mut docs = self.documents.lock();
        for r in records {
            docs.insert(r.id.clone(), (r.version, r.content.clone()));
        }
        Ok(BatchReport {
            upserted: records.len(),
            deleted: 0,
            dropped: Vec::<DroppedRecord>::new(),
        })
    }

    async fn delete_batch(&self, _index: &str, ids: &[String]) -> Result<BatchReport> {
        self.check_failures()?;
        let mut docs = self.documents.lock();
        for id in ids {
            docs.remove(id);
        }
        Ok(BatchReport {
            upserted: 0,
            deleted: ids.len(),
            dropped: Vec::<DroppedRecord>::new(),
        })
    }
}

fn write_events(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file.flush().unwrap();
    file
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        consumer: ConsumerConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            fatal_after: 3,
        },
        dedupe: DedupConfig {
            capacity: 1024,
            ttl: None,
        },
        batch: BatchConfig {
            max_batch_size: 100,
            max_batch_age: Duration::from_secs(60),
            destination_index: "test".to_string(),
        },
        writer: WriterConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        runtime: RuntimeConfig {
            drain_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    }
}

async fn run_replay(
    file: &NamedTempFile,
    backend: Arc<FakeIndex>,
    config: PipelineConfig,
) -> Result<PipelineSummary> {
    let gateway = JsonlGateway::new(JsonlConfig {
        input: file.path().to_path_buf(),
    });
    pipeline::run(gateway, backend, config, Shutdown::new()).await
}

#[tokio::test]
async fn test_replay_end_to_end() {
    let file = write_events(&[
        r#"{"channel_id":"c1","message_id":"a","kind":"create","timestamp":1,"payload":{"text":"café time"}}"#,
        r#"{"channel_id":"c1","message_id":"b","kind":"create","timestamp":1,"payload":"bonjour"}"#,
        r#"{"channel_id":"c1","message_id":"a","kind":"update","timestamp":3,"payload":{"text":"updated café"}}"#,
        r#"{"channel_id":"c1","message_id":"a","kind":"update","timestamp":2,"payload":{"text":"stale edit"}}"#,
        r#"{"channel_id":"c1","message_id":"b","kind":"delete","timestamp":2}"#,
        r#"{"channel_id":"c1","message_id":"c","kind":"create","timestamp":3,"payload":{"attachment":"img"}}"#,
    ]);

    let backend = Arc::new(FakeIndex::default());
    let summary = run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();

    let docs = backend.snapshot();

    // Message a ends at its newest version, transliterated; the stale
    // out-of-order edit never clobbers it
    let a = docs.get(&document_id("c1", "a")).unwrap();
    assert_eq!(a.0, 3);
    assert_eq!(a.1, "updated cafe");

    // Message b was created then deleted
    assert!(!docs.contains_key(&document_id("c1", "b")));

    // The attachment-only event carries no indexable text
    assert!(!docs.contains_key(&document_id("c1", "c")));

    assert_eq!(summary.source.total_events, 6);
    assert_eq!(summary.source.decode_errors, 0);
    assert_eq!(summary.normalize_dropped, 1);
    assert_eq!(summary.normalized, 5);
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let file = write_events(&[
        r#"{"channel_id":"c1","message_id":"a","kind":"create","timestamp":1,"payload":{"text":"hello"}}"#,
        r#"{"channel_id":"c1","message_id":"b","kind":"create","timestamp":1,"payload":{"text":"world"}}"#,
        r#"{"channel_id":"c1","message_id":"b","kind":"delete","timestamp":2}"#,
    ]);

    let backend = Arc::new(FakeIndex::default());
    run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();
    let first = backend.snapshot();

    // Replaying the whole stream again (fresh cache, as after a restart)
    // converges to the same index state
    run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();
    let second = backend.snapshot();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert!(first.contains_key(&document_id("c1", "a")));
}

#[tokio::test]
async fn test_duplicate_lines_collapse_to_one_upsert() {
    let line = r#"{"channel_id":"c1","message_id":"a","kind":"create","timestamp":1,"payload":{"text":"hello"}}"#;
    let file = write_events(&[line, line, line]);

    let backend = Arc::new(FakeIndex::default());
    let summary = run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();

    assert_eq!(summary.writer.records_upserted, 1);
    assert_eq!(backend.snapshot().len(), 1);
}

#[tokio::test]
async fn test_transient_index_failures_recovered() {
    let file = write_events(&[
        r#"{"channel_id":"c1","message_id":"a","kind":"create","timestamp":1,"payload":{"text":"one"}}"#,
        r#"{"channel_id":"c1","message_id":"b","kind":"create","timestamp":1,"payload":{"text":"two"}}"#,
        r#"{"channel_id":"c1","message_id":"c","kind":"create","timestamp":1,"payload":{"text":"three"}}"#,
    ]);

    let backend = Arc::new(FakeIndex::default());
    backend.fail_transient.store(2, Ordering::SeqCst);

    let summary = run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();

    assert_eq!(backend.snapshot().len(), 3);
    assert_eq!(summary.writer.retries, 2);
    assert_eq!(summary.writer.batches_failed, 0);
}

#[tokio::test]
async fn test_fatal_index_failure_surfaces() {
    let file = write_events(&[
        r#"{"channel_id":"c1","message_id":"a","kind":"create","timestamp":1,"payload":{"text":"one"}}"#,
    ]);

    let backend = Arc::new(FakeIndex::default());
    backend.fatal.store(true, Ordering::SeqCst);

    let err = run_replay(&file, backend, test_config()).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_tombstone_for_absent_document_is_noop() {
    let file = write_events(&[
        r#"{"channel_id":"c1","message_id":"ghost","kind":"delete","timestamp":1}"#,
    ]);

    let backend = Arc::new(FakeIndex::default());
    let summary = run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();

    assert!(backend.snapshot().is_empty());
    assert_eq!(summary.writer.records_deleted, 1);
    assert_eq!(summary.writer.batches_committed, 1);
}

#[tokio::test]
async fn test_malformed_lines_skipped() {
    let file = write_events(&[
        r#"{"channel_id":"c1","message_id":"a","kind":"create","timestamp":1,"payload":{"text":"ok"}}"#,
        "this is not json",
        r#"{"channel_id":"c1","message_id":"b","kind":"create","timestamp":1,"payload":{"text":"also ok"}}"#,
    ]);

    let backend = Arc::new(FakeIndex::default());
    let summary = run_replay(&file, Arc::clone(&backend), test_config())
        .await
        .unwrap();

    assert_eq!(summary.source.decode_errors, 1);
    assert_eq!(backend.snapshot().len(), 2);
}

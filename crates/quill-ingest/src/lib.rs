//! Quill ingestion pipeline components.
//!
//! This crate provides the core pipeline for ingesting chat message events
//! from an upstream gateway into a hosted search index.
//!
//! # Modules
//!
//! - [`pipeline`] - Core pipeline components (dedup cache, batcher, index writer)
//! - [`source`] - Event source adapters (gateway consumer, JSONL replay)
//! - [`shutdown`] - Awaitable shutdown signal shared across pipeline tasks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Event Sources  │  (live gateway, JSONL replay files)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   Normalizer    │  transliterate, strip controls, derive document id
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   DedupCache    │  bounded LRU+TTL - suppresses stale/duplicate records
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Batcher     │  size/age-bounded batches per destination index
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   IndexWriter   │  upsert/delete batches with retry and requeue
//! └─────────────────┘
//! ```
//!
//! The pipeline is at-least-once: the dedup cache and the in-flight batch
//! are non-durable, and the index writer's upserts are idempotent so that
//! duplicate work after eviction or restart is harmless.

pub mod error;
pub mod pipeline;
pub mod shutdown;
pub mod source;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use shutdown::Shutdown;

// Re-export pipeline components for convenience
pub use pipeline::{
    BatchConfig, BatchReport, Batcher, CommitOutcome, DedupCache, DedupConfig, DroppedRecord,
    HttpIndexConfig, HttpSearchIndex, IndexWriter, PipelineConfig, PipelineSummary, RuntimeConfig,
    SearchIndex, WriterConfig,
};

// Re-export source trait and adapters
pub use source::{
    ConsumerConfig, Cursor, EventConsumer, Gateway, GatewayConnection, JsonlConfig, JsonlGateway,
    SourceStats,
};

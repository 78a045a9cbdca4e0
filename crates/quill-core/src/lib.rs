//! Core types, normalization, and shared utilities for the Quill ingestion
//! pipeline.
//!
//! This crate provides:
//! - The canonical event and record types shared across the pipeline
//! - Deterministic document id and content hash derivation
//! - The pure normalizer (transliteration, control stripping, tombstones)
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
mod normalize;
mod record;

pub use error::{Error, Result};
pub use normalize::{normalize, normalize_text};
pub use record::{content_hash, document_id, ContentHash, EventKind, RawEvent, Record};

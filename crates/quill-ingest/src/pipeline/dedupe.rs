//! Dedup cache for normalized records.
//!
//! This module provides the [`DedupCache`], a bounded in-memory map from
//! document id to the last committed version and content hash. It
//! suppresses redundant processing of records the index already reflects.
//!
//! # Semantics
//!
//! - [`should_process`](DedupCache::should_process) answers whether a record
//!   carries anything new: stale versions and exact redeliveries are
//!   suppressed, everything else passes.
//! - [`commit`](DedupCache::commit) is called by the pipeline only after the
//!   record was successfully indexed, and never moves an entry's version
//!   backwards.
//!
//! The cache is bounded by capacity and an optional TTL. Eviction may cause
//! an already-indexed record to be reprocessed; that is acceptable
//! degradation because index upserts are idempotent.

use metrics::{counter, gauge};
use moka::sync::Cache;
use quill_core::{ContentHash, Record};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for the dedup cache.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum number of entries.
    pub capacity: u64,

    /// Optional time-to-live per entry. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    version: u64,
    content_hash: ContentHash,
}

/// Bounded dedup cache keyed by document id.
///
/// Thread-safe: can be shared across tasks via `Arc<DedupCache>`.
pub struct DedupCache {
    cache: Cache<String, CacheEntry>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl DedupCache {
    /// Create a new dedup cache with the given bounds.
    pub fn new(config: DedupConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.capacity);
        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }

        tracing::info!(
            capacity = config.capacity,
            ttl_secs = config.ttl.map(|d| d.as_secs()),
            "dedup cache initialized"
        );

        Self {
            cache: builder.build(),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Whether this record carries anything the index doesn't have yet.
    ///
    /// Returns `false` when a cached entry is newer than the record, or has
    /// the same version and an identical content hash. Callers that get
    /// `true` must call [`commit`](DedupCache::commit) after the record is
    /// successfully indexed.
    pub fn should_process(&self, record: &Record) -> bool {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        counter!("dedupe_lookups_total").increment(1);

        let suppressed = match self.cache.get(&record.id) {
            Some(entry) => {
                entry.version > record.version
                    || (entry.version == record.version
                        && entry.content_hash == record.content_hash())
            }
            None => false,
        };

        if suppressed {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!("dedupe_hits_total").increment(1);
            tracing::debug!(id = %record.id, version = record.version, "suppressing duplicate record");
        }

        !suppressed
    }

    /// Record a successfully indexed record.
    ///
    /// Versions only move forward: a commit for a version at or below the
    /// cached one is a no-op, so concurrent commit workers cannot regress
    /// an entry.
    pub fn commit(&self, record: &Record) {
        if let Some(existing) = self.cache.get(&record.id) {
            if existing.version > record.version {
                return;
            }
        }

        self.cache.insert(
            record.id.clone(),
            CacheEntry {
                version: record.version,
                content_hash: record.content_hash(),
            },
        );
        gauge!("dedupe_entries").set(self.cache.entry_count() as f64);
    }

    /// Get statistics about the cache.
    pub fn stats(&self) -> DedupeStats {
        DedupeStats {
            entries: self.cache.entry_count(),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the dedup cache.
#[derive(Debug, Clone)]
pub struct DedupeStats {
    /// Entries currently cached.
    pub entries: u64,

    /// Total lookups served.
    pub lookups: u64,

    /// Lookups that suppressed a duplicate.
    pub hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: u64, content: &str) -> Record {
        Record {
            id: id.to_string(),
            channel_id: "chan".to_string(),
            content: content.to_string(),
            version,
            tombstone: false,
        }
    }

    fn small_cache() -> DedupCache {
        DedupCache::new(DedupConfig {
            capacity: 64,
            ttl: None,
        })
    }

    #[test]
    fn test_unknown_record_passes() {
        let cache = small_cache();
        assert!(cache.should_process(&record("a", 1, "hello")));
    }

    #[test]
    fn test_exact_duplicate_suppressed() {
        let cache = small_cache();
        let r = record("a", 1, "hello");
        assert!(cache.should_process(&r));
        cache.commit(&r);
        assert!(!cache.should_process(&r));
    }

    #[test]
    fn test_monotonicity_in_order() {
        let cache = small_cache();
        let v1 = record("a", 1, "old");
        let v2 = record("a", 2, "new");

        cache.commit(&v1);
        assert!(cache.should_process(&v2));
        cache.commit(&v2);

        // Late-arriving stale v1 is rejected
        assert!(!cache.should_process(&v1));
    }

    #[test]
    fn test_monotonicity_out_of_order_commit() {
        let cache = small_cache();
        let v1 = record("a", 1, "old");
        let v2 = record("a", 2, "new");

        cache.commit(&v2);
        // A stale commit never regresses the entry
        cache.commit(&v1);
        assert!(!cache.should_process(&v1));
        assert!(!cache.should_process(&v2));
    }

    #[test]
    fn test_same_version_different_content_reprocessed() {
        let cache = small_cache();
        cache.commit(&record("a", 1, "one"));
        assert!(cache.should_process(&record("a", 1, "two")));
    }

    #[test]
    fn test_independent_ids() {
        let cache = small_cache();
        cache.commit(&record("a", 5, "x"));
        assert!(cache.should_process(&record("b", 1, "y")));
    }

    #[test]
    fn test_ttl_expiry_allows_reprocessing() {
        let cache = DedupCache::new(DedupConfig {
            capacity: 64,
            ttl: Some(Duration::from_millis(20)),
        });
        let r = record("a", 1, "hello");
        cache.commit(&r);
        assert!(!cache.should_process(&r));

        std::thread::sleep(Duration::from_millis(40));
        // Reprocessing after expiry is acceptable degradation, not an error
        assert!(cache.should_process(&r));
    }

    #[test]
    fn test_stats_count_hits() {
        let cache = small_cache();
        let r = record("a", 1, "hello");
        cache.commit(&r);
        cache.should_process(&r);
        cache.should_process(&r);

        let stats = cache.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 2);
    }
}

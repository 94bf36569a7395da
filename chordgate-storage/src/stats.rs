//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate stored bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of expired entries removed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Counters of the tiered store as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TieredStats {
    pub fast: CacheStats,
    /// `None` when no durable tier is configured.
    pub durable: Option<CacheStats>,
    pub fast_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    /// Durable reads or writes that failed or timed out.
    pub durable_failures: u64,
    /// Durable operations skipped while backing off.
    pub durable_skipped: u64,
}

impl TieredStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.fast_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Lock-free counters backing [`TieredStats`].
#[derive(Debug, Default)]
pub(crate) struct TieredCounters {
    pub fast_hits: AtomicU64,
    pub durable_hits: AtomicU64,
    pub misses: AtomicU64,
    pub durable_failures: AtomicU64,
    pub durable_skipped: AtomicU64,
}

impl TieredCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

//! Process-local LRU tier.
//!
//! Bounded both by entry count and by aggregate stored bytes. Expired entries
//! are invisible to reads and removed lazily when encountered, or in bulk by
//! [`FastTier::purge_expired`].

use std::num::NonZeroUsize;

use chordgate_core::{CacheKey, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;

use crate::{CacheEntry, CacheStats};

struct FastInner {
    entries: LruCache<CacheKey, CacheEntry>,
    bytes: u64,
    stats: CacheStats,
}

/// LRU cache behind a mutex. Critical sections never await or do I/O.
pub struct FastTier {
    inner: Mutex<FastInner>,
    max_entries: NonZeroUsize,
    max_bytes: u64,
}

impl FastTier {
    /// A zero `max_entries` is treated as one.
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(FastInner {
                entries: LruCache::unbounded(),
                bytes: 0,
                stats: CacheStats::default(),
            }),
            max_entries: NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN),
            max_bytes,
        }
    }

    /// Look up a live entry, marking it most recently used.
    pub fn get(&self, key: &CacheKey, now: Timestamp) -> Option<CacheEntry> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let state = inner.entries.get_mut(key).map(|entry| {
            if entry.is_expired(now) {
                true
            } else {
                entry.touch(now);
                false
            }
        });

        let Some(expired) = state else {
            inner.stats.misses += 1;
            return None;
        };

        if expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(entry.stored_size());
                inner.stats.expirations += 1;
            }
            inner.stats.misses += 1;
            return None;
        }

        inner.stats.hits += 1;
        inner.entries.peek(key).cloned()
    }

    /// Whether a live entry exists, without touching recency or stats.
    pub fn contains_live(&self, key: &CacheKey, now: Timestamp) -> bool {
        self.inner
            .lock()
            .entries
            .peek(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Insert or replace an entry, evicting least-recently-used entries until
    /// both bounds hold. Returns how many entries were evicted.
    ///
    /// An entry larger than the byte bound is not stored (and any older copy
    /// under the same key is dropped).
    pub fn put(&self, entry: CacheEntry) -> usize {
        let mut inner = self.inner.lock();

        if let Some(previous) = inner.entries.pop(&entry.key) {
            inner.bytes = inner.bytes.saturating_sub(previous.stored_size());
        }

        let size = entry.stored_size();
        if size > self.max_bytes {
            tracing::debug!(
                cache_key = %entry.key.short(),
                size_bytes = size,
                max_bytes = self.max_bytes,
                "entry larger than fast tier, not cached"
            );
            Self::sync_counts(&mut inner);
            return 0;
        }

        let mut evicted = 0;
        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.max_entries.get()
                || inner.bytes + size > self.max_bytes)
        {
            match inner.entries.pop_lru() {
                Some((_, old)) => {
                    inner.bytes = inner.bytes.saturating_sub(old.stored_size());
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.bytes += size;
        inner.entries.put(entry.key, entry);
        inner.stats.evictions += evicted as u64;
        Self::sync_counts(&mut inner);
        evicted
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.bytes = inner.bytes.saturating_sub(entry.stored_size());
                Self::sync_counts(&mut inner);
                true
            }
            None => false,
        }
    }

    /// Physically remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(entry.stored_size());
            }
        }
        inner.stats.expirations += expired.len() as u64;
        Self::sync_counts(&mut inner);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    fn sync_counts(inner: &mut FastInner) {
        inner.stats.entry_count = inner.entries.len() as u64;
        inner.stats.memory_bytes = inner.bytes;
    }
}

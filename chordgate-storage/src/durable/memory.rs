//! In-memory durable tier.
//!
//! Clones share one store, so several coordinators built from clones of the
//! same tier behave like instances sharing a remote cache. Used for tests
//! and single-host deployments without a cache directory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chordgate_core::{CacheKey, Timestamp};
use parking_lot::Mutex;

use super::{plan_evictions, DurableTier, DurableTierError, PutOutcome, StoredMeta};
use crate::{CacheEntry, CacheStats};

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<CacheKey, CacheEntry>,
    stats: CacheStats,
}

/// Shared in-memory tier with a byte cap.
#[derive(Debug, Clone)]
pub struct InMemoryDurableTier {
    inner: Arc<Mutex<MemoryInner>>,
    cap_bytes: u64,
}

impl InMemoryDurableTier {
    pub fn new(cap_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            cap_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored bytes, expired entries included.
    pub fn stored_bytes(&self) -> u64 {
        self.inner
            .lock()
            .entries
            .values()
            .map(CacheEntry::stored_size)
            .sum()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }
}

#[async_trait]
impl DurableTier for InMemoryDurableTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(
        &self,
        key: &CacheKey,
        now: Timestamp,
    ) -> Result<Option<CacheEntry>, DurableTierError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get_mut(key) {
            None => {
                inner.stats.misses += 1;
                return Ok(None);
            }
            Some(entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.touch(now);
                    false
                }
            }
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            inner.stats.expirations += 1;
            return Ok(None);
        }

        inner.stats.hits += 1;
        Ok(inner.entries.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, DurableTierError> {
        let mut inner = self.inner.lock();
        let now = entry.last_access_at;

        let metas: Vec<StoredMeta> = inner
            .entries
            .values()
            .map(|e| StoredMeta {
                key: e.key,
                stored_size: e.stored_size(),
                expires_at: e.expires_at,
                last_access_at: e.last_access_at,
            })
            .collect();

        let Some(victims) =
            plan_evictions(&metas, &entry.key, entry.stored_size(), self.cap_bytes, now)
        else {
            return Ok(PutOutcome {
                stored: false,
                evicted: 0,
            });
        };

        let mut evicted = 0u64;
        for victim in victims {
            if let Some(old) = inner.entries.remove(&victim) {
                if victim == entry.key {
                    continue;
                }
                evicted += 1;
                if old.is_expired(now) {
                    inner.stats.expirations += 1;
                } else {
                    inner.stats.evictions += 1;
                }
            }
        }

        inner.entries.insert(entry.key, entry);
        Ok(PutOutcome {
            stored: true,
            evicted,
        })
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, DurableTierError> {
        Ok(self.inner.lock().entries.remove(key).is_some())
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, DurableTierError> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let removed = (before - inner.entries.len()) as u64;
        inner.stats.expirations += removed;
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, DurableTierError> {
        let inner = self.inner.lock();
        Ok(CacheStats {
            entry_count: inner.entries.len() as u64,
            memory_bytes: inner.entries.values().map(CacheEntry::stored_size).sum(),
            ..inner.stats.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 32])
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn entry_at(n: u8, len: usize, secs: i64) -> CacheEntry {
        CacheEntry::new(
            key(n),
            vec![n; len],
            t0() + ChronoDuration::seconds(secs),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let a = InMemoryDurableTier::new(1 << 20);
        let b = a.clone();
        a.put(entry_at(1, 10, 0)).await.unwrap();
        assert!(b.get(&key(1), t0()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_byte_cap_never_exceeded() {
        let one = entry_at(1, 50, 0).stored_size();
        let tier = InMemoryDurableTier::new(one * 4);
        for n in 0..20u8 {
            tier.put(entry_at(n, 50, i64::from(n))).await.unwrap();
            assert!(tier.stored_bytes() <= one * 4);
        }
        assert_eq!(tier.len(), 4);
        // The four most recent survive.
        for n in 16..20u8 {
            assert!(tier.contains(&key(n)));
        }
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let one = entry_at(1, 50, 0).stored_size();
        let tier = InMemoryDurableTier::new(one * 2);
        tier.put(entry_at(1, 50, 0)).await.unwrap();
        tier.put(entry_at(2, 50, 1)).await.unwrap();
        tier.get(&key(1), t0() + ChronoDuration::seconds(2)).await.unwrap();
        tier.put(entry_at(3, 50, 3)).await.unwrap();
        assert!(tier.contains(&key(1)));
        assert!(!tier.contains(&key(2)));
        assert_eq!(tier.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let tier = InMemoryDurableTier::new(1 << 20);
        tier.put(CacheEntry::new(key(1), vec![1], t0(), Duration::from_secs(10)))
            .await
            .unwrap();
        let just_before = t0() + ChronoDuration::milliseconds(9_999);
        let just_after = t0() + ChronoDuration::milliseconds(10_001);
        assert!(tier.get(&key(1), just_before).await.unwrap().is_some());
        assert!(tier.get(&key(1), just_after).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let tier = InMemoryDurableTier::new(1 << 20);
        tier.put(CacheEntry::new(key(1), vec![1], t0(), Duration::from_secs(10)))
            .await
            .unwrap();
        tier.put(entry_at(2, 1, 0)).await.unwrap();
        let removed = tier.purge_expired(t0() + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(tier.len(), 1);
    }
}

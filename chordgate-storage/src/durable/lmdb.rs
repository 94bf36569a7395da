//! LMDB-backed durable tier.
//!
//! Uses the heed crate (Rust bindings for LMDB): a memory-mapped store that
//! survives restarts and can be opened by several processes on one host.
//!
//! # Layout
//!
//! Three named databases share one environment:
//!
//! - `entries`: [`DurableKey`] to encoded [`CacheEntry`]
//! - `access`: `[last_access_at: 8 BE][cache key: 32]` to
//!   `[stored_size: 8][expires_at: 8]`, ordered oldest access first
//! - `meta`: `total_bytes`, the sum of `stored_size` over every access row
//!
//! Eviction pops rows off the front of `access` until the incoming entry
//! fits, so a write costs O(evicted) instead of a scan of the whole store.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions with a single writer. Every operation runs
//! on the blocking pool; eviction, the running total and the insert share one
//! write transaction, so concurrent writers (in-process or not) cannot push
//! the tier over its cap.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chordgate_core::{CacheKey, Timestamp};
use chrono::DateTime;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use parking_lot::Mutex;

use super::{DurableKey, DurableTier, DurableTierError, PutOutcome};
use crate::{CacheEntry, CacheStats};

const ENTRIES_DB: &str = "entries";
const ACCESS_DB: &str = "access";
const META_DB: &str = "meta";

const TOTAL_BYTES_KEY: &[u8] = b"total_bytes";

const ACCESS_KEY_LEN: usize = 8 + CacheKey::LEN;
const ACCESS_VALUE_LEN: usize = 8 + 8;

/// Counters not derivable from the store itself.
#[derive(Debug, Default)]
struct LmdbCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// One row of the access index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AccessRow {
    last_access_at: Timestamp,
    key: CacheKey,
    stored_size: u64,
    expires_at: Timestamp,
}

impl AccessRow {
    fn for_entry(entry: &CacheEntry, stored_size: u64) -> Self {
        Self {
            last_access_at: entry.last_access_at,
            key: entry.key,
            stored_size,
            expires_at: entry.expires_at,
        }
    }

    fn index_key(&self) -> [u8; ACCESS_KEY_LEN] {
        access_key(self.last_access_at, &self.key)
    }

    fn encode_value(&self) -> [u8; ACCESS_VALUE_LEN] {
        let mut bytes = [0u8; ACCESS_VALUE_LEN];
        bytes[..8].copy_from_slice(&self.stored_size.to_le_bytes());
        bytes[8..].copy_from_slice(&self.expires_at.timestamp_millis().to_le_bytes());
        bytes
    }

    fn decode(raw_key: &[u8], raw_value: &[u8]) -> Option<Self> {
        if raw_key.len() != ACCESS_KEY_LEN {
            return None;
        }
        let ordered = u64::from_be_bytes(raw_key[..8].try_into().ok()?);
        let last_access_at = DateTime::from_timestamp_millis((ordered ^ SIGN_BIT) as i64)?;
        let key = CacheKey::from_slice(&raw_key[8..])?;
        let (stored_size, expires_at) = decode_access_value(raw_value)?;
        Some(Self {
            last_access_at,
            key,
            stored_size,
            expires_at,
        })
    }
}

const SIGN_BIT: u64 = 1 << 63;

/// Index key whose byte order matches access-time order.
fn access_key(at: Timestamp, key: &CacheKey) -> [u8; ACCESS_KEY_LEN] {
    let ordered = (at.timestamp_millis() as u64) ^ SIGN_BIT;
    let mut bytes = [0u8; ACCESS_KEY_LEN];
    bytes[..8].copy_from_slice(&ordered.to_be_bytes());
    bytes[8..].copy_from_slice(key.as_bytes());
    bytes
}

fn decode_access_value(raw: &[u8]) -> Option<(u64, Timestamp)> {
    if raw.len() != ACCESS_VALUE_LEN {
        return None;
    }
    let stored_size = u64::from_le_bytes(raw[..8].try_into().ok()?);
    let expires_at = DateTime::from_timestamp_millis(i64::from_le_bytes(raw[8..].try_into().ok()?))?;
    Some((stored_size, expires_at))
}

/// Access time recorded in a stored entry's header.
fn stored_access(raw: &[u8]) -> Option<Timestamp> {
    CacheEntry::decode_header(raw).map(|(_, last_access_at)| last_access_at)
}

/// LMDB durable tier bounded by a byte cap.
///
/// Cheap to clone; clones share the environment.
#[derive(Clone)]
pub struct LmdbDurableTier {
    env: Env,
    entries: Database<Bytes, Bytes>,
    access: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    cap_bytes: u64,
    counters: Arc<Mutex<LmdbCounters>>,
}

impl std::fmt::Debug for LmdbDurableTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbDurableTier")
            .field("path", &self.env.path())
            .field("cap_bytes", &self.cap_bytes)
            .finish()
    }
}

impl LmdbDurableTier {
    /// Open (or create) the tier.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_bytes` - LMDB map size; must be at least `cap_bytes`
    /// * `cap_bytes` - Byte cap enforced by eviction
    pub fn open<P: AsRef<Path>>(
        path: P,
        map_size_bytes: u64,
        cap_bytes: u64,
    ) -> Result<Self, DurableTierError> {
        std::fs::create_dir_all(&path).map_err(|e| DurableTierError::Unavailable {
            reason: format!("cannot create {}: {}", path.as_ref().display(), e),
        })?;

        let map_size = usize::try_from(map_size_bytes).unwrap_or(usize::MAX);

        // SAFETY: the environment is opened once per tier and never while
        // another handle in this process holds the same path open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(3)
                .open(path.as_ref())
        }
        .map_err(|e| DurableTierError::Unavailable {
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn()?;
        let entries: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(ENTRIES_DB))?;
        let access: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(ACCESS_DB))?;
        let meta: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(META_DB))?;
        wtxn.commit()?;

        tracing::info!(
            path = %path.as_ref().display(),
            map_size_bytes,
            cap_bytes,
            "opened LMDB durable tier"
        );

        Ok(Self {
            env,
            entries,
            access,
            meta,
            cap_bytes,
            counters: Arc::new(Mutex::new(LmdbCounters::default())),
        })
    }

    pub fn cap_bytes(&self) -> u64 {
        self.cap_bytes
    }

    // ========================================================================
    // Running total and access index
    // ========================================================================

    fn read_total(&self, txn: &RoTxn) -> Result<u64, DurableTierError> {
        Ok(self
            .meta
            .get(txn, TOTAL_BYTES_KEY)?
            .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0))
    }

    fn write_total(&self, wtxn: &mut RwTxn, total: u64) -> Result<(), DurableTierError> {
        self.meta.put(wtxn, TOTAL_BYTES_KEY, &total.to_le_bytes())?;
        Ok(())
    }

    /// Remove the access row for `key` at `at`, returning its size.
    fn drop_row(
        &self,
        wtxn: &mut RwTxn,
        at: Timestamp,
        key: &CacheKey,
    ) -> Result<u64, DurableTierError> {
        let index_key = access_key(at, key);
        let size = self
            .access
            .get(wtxn, &index_key)?
            .and_then(decode_access_value)
            .map(|(size, _)| size);
        match size {
            Some(size) => {
                self.access.delete(wtxn, &index_key)?;
                Ok(size)
            }
            None => Ok(0),
        }
    }

    /// Delete an entry and its access row.
    ///
    /// Returns the bytes released from the running total, or `None` when the
    /// key was not stored.
    fn unlink(&self, wtxn: &mut RwTxn, key: &CacheKey) -> Result<Option<u64>, DurableTierError> {
        let encoded = DurableKey::new(*key).encode();
        let accessed = match self.entries.get(wtxn, &encoded)? {
            Some(raw) => stored_access(raw),
            None => return Ok(None),
        };
        self.entries.delete(wtxn, &encoded)?;
        // An entry without a readable header was never indexed by this tier.
        let released = match accessed {
            Some(at) => self.drop_row(wtxn, at, key)?,
            None => 0,
        };
        Ok(Some(released))
    }

    /// Remove an access row and, unless the row is stale, its entry.
    ///
    /// Returns `true` when an entry was deleted.
    fn evict_row(&self, wtxn: &mut RwTxn, row: &AccessRow) -> Result<bool, DurableTierError> {
        let encoded = DurableKey::new(row.key).encode();
        let current = self.entries.get(wtxn, &encoded)?.and_then(stored_access);
        self.access.delete(wtxn, &row.index_key())?;
        if current == Some(row.last_access_at) {
            self.entries.delete(wtxn, &encoded)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Oldest access row, discarding undecodable rows on the way.
    fn oldest_row(&self, wtxn: &mut RwTxn) -> Result<Option<AccessRow>, DurableTierError> {
        loop {
            let Some((raw_key, raw_value)) = self
                .access
                .first(wtxn)?
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
            else {
                return Ok(None);
            };
            match AccessRow::decode(&raw_key, &raw_value) {
                Some(row) => return Ok(Some(row)),
                None => {
                    self.access.delete(wtxn, &raw_key)?;
                }
            }
        }
    }

    // ========================================================================
    // Blocking operations
    // ========================================================================

    fn get_blocking(
        &self,
        key: CacheKey,
        now: Timestamp,
    ) -> Result<Option<CacheEntry>, DurableTierError> {
        let encoded = DurableKey::new(key).encode();

        let found = {
            let rtxn = self.env.read_txn()?;
            self.entries.get(&rtxn, &encoded)?.map(|b| b.to_vec())
        };

        let Some(bytes) = found else {
            self.counters.lock().misses += 1;
            return Ok(None);
        };

        let mut entry = match CacheEntry::decode(key, &bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.delete_blocking(key)?;
                self.counters.lock().misses += 1;
                return Err(e);
            }
        };

        if entry.is_expired(now) {
            self.delete_blocking(key)?;
            let mut counters = self.counters.lock();
            counters.misses += 1;
            counters.expirations += 1;
            return Ok(None);
        }

        let previous = entry.last_access_at;
        entry.touch(now);
        if entry.last_access_at != previous {
            self.touch_blocking(&entry, previous)?;
        }

        self.counters.lock().hits += 1;
        Ok(Some(entry))
    }

    /// Move an entry to its new position in the access order.
    fn touch_blocking(&self, entry: &CacheEntry, previous: Timestamp) -> Result<(), DurableTierError> {
        let encoded = DurableKey::new(entry.key).encode();
        let mut wtxn = self.env.write_txn()?;

        // Replaced or evicted by another writer since it was read.
        let current = self.entries.get(&wtxn, &encoded)?.and_then(stored_access);
        if current != Some(previous) {
            return Ok(());
        }

        let released = self.drop_row(&mut wtxn, previous, &entry.key)?;
        let encoded_value = entry.encode();
        let row = AccessRow::for_entry(entry, encoded_value.len() as u64);
        self.entries.put(&mut wtxn, &encoded, &encoded_value)?;
        self.access.put(&mut wtxn, &row.index_key(), &row.encode_value())?;

        if released != row.stored_size {
            let total = self.read_total(&wtxn)?.saturating_sub(released) + row.stored_size;
            self.write_total(&mut wtxn, total)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn put_blocking(&self, entry: CacheEntry) -> Result<PutOutcome, DurableTierError> {
        let encoded_key = DurableKey::new(entry.key).encode();
        let encoded_value = entry.encode();
        let incoming_size = encoded_value.len() as u64;

        if incoming_size > self.cap_bytes {
            tracing::debug!(
                cache_key = %entry.key.short(),
                size_bytes = incoming_size,
                cap_bytes = self.cap_bytes,
                "entry larger than durable cap, not stored"
            );
            return Ok(PutOutcome {
                stored: false,
                evicted: 0,
            });
        }

        let now = entry.last_access_at;
        let mut wtxn = self.env.write_txn()?;
        let mut total = self.read_total(&wtxn)?;

        if let Some(released) = self.unlink(&mut wtxn, &entry.key)? {
            total = total.saturating_sub(released);
        }

        let mut expired = 0u64;
        let mut evicted = 0u64;
        while total + incoming_size > self.cap_bytes {
            let Some(row) = self.oldest_row(&mut wtxn)? else {
                // Nothing indexed means nothing counted.
                total = 0;
                break;
            };
            total = total.saturating_sub(row.stored_size);
            if self.evict_row(&mut wtxn, &row)? {
                if row.expires_at <= now {
                    expired += 1;
                } else {
                    evicted += 1;
                }
            }
        }

        let row = AccessRow::for_entry(&entry, incoming_size);
        self.entries.put(&mut wtxn, &encoded_key, &encoded_value)?;
        self.access.put(&mut wtxn, &row.index_key(), &row.encode_value())?;
        self.write_total(&mut wtxn, total + incoming_size)?;
        wtxn.commit()?;

        let mut counters = self.counters.lock();
        counters.evictions += evicted;
        counters.expirations += expired;

        Ok(PutOutcome {
            stored: true,
            evicted: evicted + expired,
        })
    }

    fn delete_blocking(&self, key: CacheKey) -> Result<bool, DurableTierError> {
        let mut wtxn = self.env.write_txn()?;
        let Some(released) = self.unlink(&mut wtxn, &key)? else {
            return Ok(false);
        };
        let total = self.read_total(&wtxn)?.saturating_sub(released);
        self.write_total(&mut wtxn, total)?;
        wtxn.commit()?;
        Ok(true)
    }

    fn purge_blocking(&self, now: Timestamp) -> Result<u64, DurableTierError> {
        let mut wtxn = self.env.write_txn()?;

        let mut expired = Vec::new();
        for item in self.access.iter(&wtxn)? {
            let (raw_key, raw_value) = item?;
            if let Some(row) = AccessRow::decode(raw_key, raw_value) {
                if row.expires_at <= now {
                    expired.push(row);
                }
            }
        }

        let mut total = self.read_total(&wtxn)?;
        let mut removed = 0u64;
        for row in &expired {
            total = total.saturating_sub(row.stored_size);
            if self.evict_row(&mut wtxn, row)? {
                removed += 1;
            }
        }
        self.write_total(&mut wtxn, total)?;
        wtxn.commit()?;

        self.counters.lock().expirations += removed;
        Ok(removed)
    }

    fn stats_blocking(&self) -> Result<CacheStats, DurableTierError> {
        let rtxn = self.env.read_txn()?;
        let entry_count = self.entries.len(&rtxn)?;
        let memory_bytes = self.read_total(&rtxn)?;
        let counters = self.counters.lock();
        Ok(CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            entry_count,
            memory_bytes,
            evictions: counters.evictions,
            expirations: counters.expirations,
        })
    }
}

#[async_trait]
impl DurableTier for LmdbDurableTier {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn get(
        &self,
        key: &CacheKey,
        now: Timestamp,
    ) -> Result<Option<CacheEntry>, DurableTierError> {
        let tier = self.clone();
        let key = *key;
        tokio::task::spawn_blocking(move || tier.get_blocking(key, now)).await?
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, DurableTierError> {
        let tier = self.clone();
        tokio::task::spawn_blocking(move || tier.put_blocking(entry)).await?
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, DurableTierError> {
        let tier = self.clone();
        let key = *key;
        tokio::task::spawn_blocking(move || tier.delete_blocking(key)).await?
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, DurableTierError> {
        let tier = self.clone();
        tokio::task::spawn_blocking(move || tier.purge_blocking(now)).await?
    }

    async fn stats(&self) -> Result<CacheStats, DurableTierError> {
        let tier = self.clone();
        tokio::task::spawn_blocking(move || tier.stats_blocking()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_tier(cap_bytes: u64) -> (LmdbDurableTier, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let tier = LmdbDurableTier::open(temp_dir.path(), 10 * 1024 * 1024, cap_bytes)
            .expect("tier creation should succeed");
        (tier, temp_dir)
    }

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 32])
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn entry_at(n: u8, len: usize, at: Timestamp) -> CacheEntry {
        CacheEntry::new(key(n), vec![n; len], at, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (tier, _dir) = create_test_tier(1 << 20);
        let outcome = tier.put(entry_at(1, 64, t0())).await.unwrap();
        assert!(outcome.stored);

        let got = tier.get(&key(1), t0()).await.unwrap().unwrap();
        assert_eq!(got.value, vec![1; 64]);
        assert!(tier.get(&key(2), t0()).await.unwrap().is_none());

        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_missing() {
        let (tier, _dir) = create_test_tier(1 << 20);
        tier.put(entry_at(1, 8, t0())).await.unwrap();
        let later = t0() + ChronoDuration::hours(2);
        assert!(tier.get(&key(1), later).await.unwrap().is_none());
        assert_eq!(tier.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let tier = LmdbDurableTier::open(temp_dir.path(), 10 * 1024 * 1024, 1 << 20).unwrap();
            tier.put(entry_at(5, 16, t0())).await.unwrap();
        }
        let tier = LmdbDurableTier::open(temp_dir.path(), 10 * 1024 * 1024, 1 << 20).unwrap();
        let got = tier.get(&key(5), t0()).await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recently_accessed() {
        let one = entry_at(1, 100, t0()).encode().len() as u64;
        let (tier, _dir) = create_test_tier(one * 3);

        tier.put(entry_at(1, 100, t0())).await.unwrap();
        tier.put(entry_at(2, 100, t0() + ChronoDuration::seconds(1))).await.unwrap();
        tier.put(entry_at(3, 100, t0() + ChronoDuration::seconds(2))).await.unwrap();

        // Reading 1 makes 2 the least recently accessed.
        tier.get(&key(1), t0() + ChronoDuration::seconds(3)).await.unwrap();

        let outcome = tier
            .put(entry_at(4, 100, t0() + ChronoDuration::seconds(4)))
            .await
            .unwrap();
        assert_eq!(outcome.evicted, 1);

        let at = t0() + ChronoDuration::seconds(5);
        assert!(tier.get(&key(2), at).await.unwrap().is_none());
        assert!(tier.get(&key(1), at).await.unwrap().is_some());
        assert!(tier.get(&key(4), at).await.unwrap().is_some());

        let stats = tier.stats().await.unwrap();
        assert!(stats.memory_bytes <= one * 3);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_running_total_tracks_writes_and_removals() {
        let one = entry_at(1, 100, t0()).encode().len() as u64;
        let (tier, _dir) = create_test_tier(one * 3);
        let at = |secs| t0() + ChronoDuration::seconds(secs);

        tier.put(entry_at(1, 100, at(0))).await.unwrap();
        tier.put(entry_at(2, 100, at(1))).await.unwrap();
        tier.put(entry_at(3, 100, at(2))).await.unwrap();

        // Replacing a key does not count it twice.
        let outcome = tier.put(entry_at(2, 100, at(3))).await.unwrap();
        assert_eq!(outcome.evicted, 0);
        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.memory_bytes, one * 3);

        // 1 is now the oldest access.
        let outcome = tier.put(entry_at(4, 100, at(4))).await.unwrap();
        assert_eq!(outcome.evicted, 1);
        assert!(tier.remove(&key(3)).await.unwrap());

        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.memory_bytes, one * 2);
        assert!(tier.get(&key(1), at(5)).await.unwrap().is_none());
        assert!(tier.get(&key(2), at(5)).await.unwrap().is_some());
        assert!(tier.get(&key(4), at(5)).await.unwrap().is_some());
        assert_eq!(tier.stats().await.unwrap().memory_bytes, one * 2);
    }

    #[tokio::test]
    async fn test_running_total_survives_reopen() {
        let one = entry_at(1, 100, t0()).encode().len() as u64;
        let temp_dir = TempDir::new().unwrap();
        let at = |secs| t0() + ChronoDuration::seconds(secs);
        {
            let tier = LmdbDurableTier::open(temp_dir.path(), 10 * 1024 * 1024, one * 3).unwrap();
            tier.put(entry_at(1, 100, at(0))).await.unwrap();
            tier.put(entry_at(2, 100, at(1))).await.unwrap();
        }

        let tier = LmdbDurableTier::open(temp_dir.path(), 10 * 1024 * 1024, one * 3).unwrap();
        assert_eq!(tier.stats().await.unwrap().memory_bytes, one * 2);

        tier.put(entry_at(3, 100, at(2))).await.unwrap();
        let outcome = tier.put(entry_at(4, 100, at(3))).await.unwrap();
        assert_eq!(outcome.evicted, 1);
        assert!(tier.get(&key(1), at(4)).await.unwrap().is_none());
        assert!(tier.get(&key(2), at(4)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_releases_expired_bytes() {
        let (tier, _dir) = create_test_tier(1 << 20);
        tier.put(CacheEntry::new(key(1), vec![1; 50], t0(), Duration::from_secs(10)))
            .await
            .unwrap();
        tier.put(entry_at(2, 50, t0())).await.unwrap();
        let live = entry_at(2, 50, t0()).encode().len() as u64;

        let removed = tier.purge_expired(t0() + ChronoDuration::seconds(30)).await.unwrap();
        assert_eq!(removed, 1);
        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.memory_bytes, live);
    }

    #[test]
    fn test_access_key_orders_by_time() {
        let early = access_key(t0() - ChronoDuration::days(30_000), &key(9));
        let mid = access_key(t0(), &key(0));
        let late = access_key(t0() + ChronoDuration::milliseconds(1), &key(0));
        assert!(early < mid);
        assert!(mid < late);

        let row = AccessRow {
            last_access_at: t0(),
            key: key(7),
            stored_size: 123,
            expires_at: t0() + ChronoDuration::hours(1),
        };
        assert_eq!(AccessRow::decode(&row.index_key(), &row.encode_value()), Some(row));
    }

    #[tokio::test]
    async fn test_oversized_entry_refused() {
        let (tier, _dir) = create_test_tier(64);
        let outcome = tier.put(entry_at(1, 1_000, t0())).await.unwrap();
        assert!(!outcome.stored);
        assert!(tier.get(&key(1), t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_purge() {
        let (tier, _dir) = create_test_tier(1 << 20);
        tier.put(entry_at(1, 8, t0())).await.unwrap();
        tier.put(CacheEntry::new(key(2), vec![2; 8], t0(), Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(tier.remove(&key(1)).await.unwrap());
        assert!(!tier.remove(&key(1)).await.unwrap());

        let removed = tier.purge_expired(t0() + ChronoDuration::seconds(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(tier.stats().await.unwrap().entry_count, 0);
    }
}

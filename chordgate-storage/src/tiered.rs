//! Two-tier cache store.
//!
//! Reads go fast tier first, then the durable tier (backfilling the fast tier
//! on a hit). Writes go through to both: the fast-tier write is synchronous,
//! the durable write is best-effort. Every durable round trip is bounded by
//! a timeout, and after a failure the durable tier is skipped for a backoff
//! window so an unreachable shared tier costs one timeout per window rather
//! than one per request.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chordgate_core::{CacheConfig, CacheKey, SharedClock};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::stats::TieredCounters;
use crate::{CacheEntry, DurableTier, DurableTierError, FastTier, TieredStats};

/// Which tier served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Fast,
    Durable,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Fast => "fast",
            CacheTier::Durable => "durable",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub value: Vec<u8>,
    pub tier: CacheTier,
}

/// Availability of the durable tier as seen by this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurableStatus {
    /// No durable tier configured.
    Disabled,
    Available,
    /// Skipped after a failure until the window elapses.
    BackingOff { remaining: Duration },
}

/// Entries removed by a maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub fast: u64,
    /// `None` when the durable tier is disabled, backing off or failed.
    pub durable: Option<u64>,
}

/// Fast tier plus optional durable tier.
pub struct TieredCache {
    fast: FastTier,
    durable: Option<Arc<dyn DurableTier>>,
    clock: SharedClock,
    durable_timeout: Duration,
    durable_retry_after: Duration,
    suspended_until: Mutex<Option<Instant>>,
    counters: TieredCounters,
}

impl TieredCache {
    /// Fast tier only.
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            fast: FastTier::new(config.fast_max_entries, config.fast_max_bytes),
            durable: None,
            clock,
            durable_timeout: config.durable_timeout,
            durable_retry_after: config.durable_retry_after,
            suspended_until: Mutex::new(None),
            counters: TieredCounters::default(),
        }
    }

    pub fn with_durable(mut self, durable: Arc<dyn DurableTier>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    pub fn durable_status(&self) -> DurableStatus {
        if self.durable.is_none() {
            return DurableStatus::Disabled;
        }
        match *self.suspended_until.lock() {
            Some(until) if until > Instant::now() => DurableStatus::BackingOff {
                remaining: until - Instant::now(),
            },
            _ => DurableStatus::Available,
        }
    }

    /// Look up a live value.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheLookup> {
        let now = self.clock.now();

        if let Some(entry) = self.fast.get(key, now) {
            TieredCounters::incr(&self.counters.fast_hits);
            return Some(CacheLookup {
                value: entry.value,
                tier: CacheTier::Fast,
            });
        }

        let durable_entry = match self.active_durable() {
            Some(durable) => self.durable_call("get", durable.get(key, now)).await.flatten(),
            None => None,
        };

        match durable_entry {
            Some(entry) if !entry.is_expired(now) => {
                TieredCounters::incr(&self.counters.durable_hits);
                let value = entry.value.clone();
                // Backfill keeps the durable expiry, so a backfilled copy
                // never outlives the original.
                self.fast.put(entry);
                Some(CacheLookup {
                    value,
                    tier: CacheTier::Durable,
                })
            }
            _ => {
                TieredCounters::incr(&self.counters.misses);
                None
            }
        }
    }

    /// Whether the fast tier holds a live entry. No stats, no durable call.
    pub fn peek_fast(&self, key: &CacheKey) -> bool {
        self.fast.contains_live(key, self.clock.now())
    }

    /// Write-through store. A zero TTL stores nothing.
    pub async fn put(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let entry = CacheEntry::new(key, value, self.clock.now(), ttl);
        self.fast.put(entry.clone());

        if let Some(durable) = self.active_durable() {
            if let Some(outcome) = self.durable_call("put", durable.put(entry)).await {
                if outcome.evicted > 0 {
                    tracing::debug!(
                        cache_key = %key.short(),
                        evicted = outcome.evicted,
                        "durable tier evicted entries"
                    );
                }
            }
        }
    }

    /// Remove a key from both tiers.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.fast.remove(key);
        if let Some(durable) = self.active_durable() {
            self.durable_call("remove", durable.remove(key)).await;
        }
    }

    /// Physically remove expired entries from both tiers.
    pub async fn purge_expired(&self) -> PurgeReport {
        let now = self.clock.now();
        let fast = self.fast.purge_expired(now) as u64;
        let durable = match self.active_durable() {
            Some(durable) => self.durable_call("purge", durable.purge_expired(now)).await,
            None => None,
        };
        PurgeReport { fast, durable }
    }

    /// Snapshot of both tiers. Read-only with respect to the backoff state:
    /// polling never skips, suspends or resumes the durable tier.
    pub async fn stats(&self) -> TieredStats {
        let durable = match (&self.durable, self.durable_status()) {
            (Some(durable), DurableStatus::Available) => {
                match tokio::time::timeout(self.durable_timeout, durable.stats()).await {
                    Ok(Ok(stats)) => Some(stats),
                    Ok(Err(e)) => {
                        tracing::debug!(tier = durable.name(), error = %e, "durable stats unavailable");
                        None
                    }
                    Err(_) => {
                        tracing::debug!(tier = durable.name(), "durable stats timed out");
                        None
                    }
                }
            }
            _ => None,
        };
        TieredStats {
            fast: self.fast.stats(),
            durable,
            fast_hits: TieredCounters::load(&self.counters.fast_hits),
            durable_hits: TieredCounters::load(&self.counters.durable_hits),
            misses: TieredCounters::load(&self.counters.misses),
            durable_failures: TieredCounters::load(&self.counters.durable_failures),
            durable_skipped: TieredCounters::load(&self.counters.durable_skipped),
        }
    }

    /// The durable tier, unless absent or backing off.
    fn active_durable(&self) -> Option<&Arc<dyn DurableTier>> {
        let durable = self.durable.as_ref()?;
        let mut suspended = self.suspended_until.lock();
        match *suspended {
            Some(until) if until > Instant::now() => {
                TieredCounters::incr(&self.counters.durable_skipped);
                None
            }
            Some(_) => {
                *suspended = None;
                tracing::info!(tier = durable.name(), "retrying durable tier after backoff");
                Some(durable)
            }
            None => Some(durable),
        }
    }

    /// Run a bounded durable operation, absorbing any failure.
    async fn durable_call<T, F>(&self, op: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, DurableTierError>>,
    {
        match tokio::time::timeout(self.durable_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(DurableTierError::Corrupt { reason })) => {
                tracing::warn!(op, %reason, "discarding corrupt durable entry");
                None
            }
            Ok(Err(e)) => {
                self.suspend_durable(op, &e);
                None
            }
            Err(_) => {
                self.suspend_durable(
                    op,
                    &DurableTierError::Timeout {
                        after: self.durable_timeout,
                    },
                );
                None
            }
        }
    }

    fn suspend_durable(&self, op: &'static str, error: &DurableTierError) {
        TieredCounters::incr(&self.counters.durable_failures);
        *self.suspended_until.lock() = Some(Instant::now() + self.durable_retry_after);
        tracing::warn!(
            event = "durable_tier_unavailable",
            op,
            error = %error,
            retry_after_ms = self.durable_retry_after.as_millis() as u64,
            "durable tier failed, serving from fast tier only"
        );
    }
}

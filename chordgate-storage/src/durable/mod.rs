//! Durable, shared cache tier.
//!
//! The durable tier survives restarts and may be shared by several
//! coordinator processes. It is bounded by a byte cap enforced on write with
//! LRU-by-size eviction. Its failures are infrastructure failures: the tiered
//! store absorbs them and never hands them to a request.

pub mod durable_key;
pub mod lmdb;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chordgate_core::{CacheKey, Timestamp};

use crate::{CacheEntry, CacheStats};

pub use durable_key::{DurableKey, DURABLE_KEY_PREFIX};
pub use lmdb::LmdbDurableTier;
pub use memory::InMemoryDurableTier;

/// Error type for durable-tier operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurableTierError {
    /// The tier cannot be reached or was not opened.
    #[error("Durable tier unavailable: {reason}")]
    Unavailable { reason: String },

    /// A round trip exceeded its bound.
    #[error("Durable tier timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// The backend reported a failure.
    #[error("Durable tier backend error: {reason}")]
    Backend { reason: String },

    /// A stored value could not be decoded.
    #[error("Corrupt durable entry: {reason}")]
    Corrupt { reason: String },
}

impl From<heed::Error> for DurableTierError {
    fn from(e: heed::Error) -> Self {
        DurableTierError::Backend {
            reason: e.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for DurableTierError {
    fn from(e: tokio::task::JoinError) -> Self {
        DurableTierError::Unavailable {
            reason: format!("durable worker failed: {}", e),
        }
    }
}

/// Result of a durable write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOutcome {
    /// `false` when the entry alone exceeds the byte cap.
    pub stored: bool,
    /// Entries removed to make room (expired ones included).
    pub evicted: u64,
}

/// Pluggable durable tier.
#[async_trait]
pub trait DurableTier: Send + Sync {
    /// Short backend name for logs and health checks.
    fn name(&self) -> &'static str;

    /// Fetch a live entry and record the access. Expired entries read as
    /// `None` and may be removed.
    async fn get(&self, key: &CacheKey, now: Timestamp)
        -> Result<Option<CacheEntry>, DurableTierError>;

    /// Store an entry, evicting least-recently-accessed entries until the
    /// tier is within its byte cap.
    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, DurableTierError>;

    async fn remove(&self, key: &CacheKey) -> Result<bool, DurableTierError>;

    /// Physically remove every expired entry.
    async fn purge_expired(&self, now: Timestamp) -> Result<u64, DurableTierError>;

    async fn stats(&self) -> Result<CacheStats, DurableTierError>;
}

/// Sizing facts about one stored entry, as seen by eviction planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredMeta {
    pub key: CacheKey,
    pub stored_size: u64,
    pub expires_at: Timestamp,
    pub last_access_at: Timestamp,
}

/// Decide which entries to remove so `incoming` fits under `cap_bytes`.
///
/// Expired entries go first, then live ones oldest-access first. An existing
/// entry with the incoming key is always replaced. Returns `None` when the
/// incoming entry is larger than the cap on its own.
pub(crate) fn plan_evictions(
    existing: &[StoredMeta],
    incoming_key: &CacheKey,
    incoming_size: u64,
    cap_bytes: u64,
    now: Timestamp,
) -> Option<Vec<CacheKey>> {
    if incoming_size > cap_bytes {
        return None;
    }

    let mut victims = Vec::new();
    let mut candidates: Vec<&StoredMeta> = Vec::with_capacity(existing.len());
    let mut total: u64 = 0;

    for meta in existing {
        if meta.key == *incoming_key {
            victims.push(meta.key);
        } else if meta.expires_at <= now {
            victims.push(meta.key);
        } else {
            total += meta.stored_size;
            candidates.push(meta);
        }
    }

    candidates.sort_by(|a, b| {
        a.last_access_at
            .cmp(&b.last_access_at)
            .then_with(|| a.key.cmp(&b.key))
    });

    for meta in candidates {
        if total + incoming_size <= cap_bytes {
            break;
        }
        total -= meta.stored_size;
        victims.push(meta.key);
    }

    Some(victims)
}

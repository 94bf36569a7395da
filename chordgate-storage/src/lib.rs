//! CHORDGATE Storage - Cache Store
//!
//! Two-tier store for serialized analysis results:
//!
//! - [`FastTier`]: process-local LRU bounded by entry count and bytes.
//! - [`DurableTier`]: shared, restart-surviving tier bounded by a byte cap
//!   with LRU-by-size eviction. [`LmdbDurableTier`] is the production
//!   backend; [`InMemoryDurableTier`] shares one store across clones.
//! - [`TieredCache`]: the read-through/write-through combination, failing
//!   open when the durable tier is slow or unreachable.
//!
//! Every entry carries its own `expires_at`, so expiry never depends on the
//! backend's native TTL support.

pub mod durable;
mod entry;
mod fast_tier;
mod stats;
mod tiered;

pub use durable::{
    DurableKey, DurableTier, DurableTierError, InMemoryDurableTier, LmdbDurableTier, PutOutcome,
    DURABLE_KEY_PREFIX,
};
pub use entry::CacheEntry;
pub use fast_tier::FastTier;
pub use stats::{CacheStats, TieredStats};
pub use tiered::{CacheLookup, CacheTier, DurableStatus, PurgeReport, TieredCache};

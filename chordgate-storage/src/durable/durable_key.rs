//! Namespaced keys for the durable tier.
//!
//! Durable entries may live in a store shared with other data, so every key
//! carries a fixed prefix ahead of the raw cache key bytes.

use chordgate_core::CacheKey;

/// Namespace prefix shared by every chordgate durable entry.
pub const DURABLE_KEY_PREFIX: &[u8] = b"chordgate:analysis:";

const PREFIX_LEN: usize = DURABLE_KEY_PREFIX.len();

/// Encoded length: prefix followed by the 32 key bytes.
pub const DURABLE_KEY_LEN: usize = PREFIX_LEN + CacheKey::LEN;

/// A cache key in its durable-tier form.
///
/// # Binary Format
///
/// - Bytes 0-18: `chordgate:analysis:`
/// - Bytes 19-50: cache key
///
/// Fixed-size keys keep the B-tree compact and let a prefix scan enumerate
/// exactly the chordgate entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DurableKey(CacheKey);

impl DurableKey {
    pub fn new(key: CacheKey) -> Self {
        Self(key)
    }

    pub fn cache_key(&self) -> CacheKey {
        self.0
    }

    pub fn encode(&self) -> [u8; DURABLE_KEY_LEN] {
        let mut bytes = [0u8; DURABLE_KEY_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(DURABLE_KEY_PREFIX);
        bytes[PREFIX_LEN..].copy_from_slice(self.0.as_bytes());
        bytes
    }

    /// Decode a stored key.
    ///
    /// Returns `None` if the length is wrong or the prefix does not match.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DURABLE_KEY_LEN || &bytes[..PREFIX_LEN] != DURABLE_KEY_PREFIX {
            return None;
        }
        CacheKey::from_slice(&bytes[PREFIX_LEN..]).map(Self)
    }

    /// Prefix for scanning every chordgate entry.
    pub fn scan_prefix() -> &'static [u8] {
        DURABLE_KEY_PREFIX
    }
}

impl From<CacheKey> for DurableKey {
    fn from(key: CacheKey) -> Self {
        Self(key)
    }
}

//! Cache key derivation.
//!
//! A [`CacheKey`] is the SHA-256 fingerprint of everything that affects an
//! analysis outcome: the audio content digest, the declared format, and the
//! canonical encoding of the options. Derivation is pure, so keys are stable
//! across processes and restarts and the durable tier can be shared.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{compute_content_hash, AnalysisOptions, AudioFormat, ContentHash};

/// Domain separator so chordgate keys can never collide with other SHA-256
/// values that happen to share a store.
const KEY_DOMAIN: &[u8] = b"chordgate.cache-key.v1";

/// Fixed-length cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Rebuild a key from a slice, e.g. when decoding a stored key.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

/// Audio content as seen by the key deriver: raw bytes, or a digest the
/// caller already computed (e.g. while streaming an upload).
#[derive(Debug, Clone, Copy)]
pub enum AudioContent<'a> {
    Bytes(&'a [u8]),
    Digest(ContentHash),
}

impl AudioContent<'_> {
    pub fn digest(&self) -> ContentHash {
        match self {
            AudioContent::Bytes(bytes) => compute_content_hash(bytes),
            AudioContent::Digest(digest) => *digest,
        }
    }
}

/// Derive the cache key for a request.
///
/// `AudioContent::Bytes(b)` and `AudioContent::Digest(sha256(b))` derive the
/// same key.
pub fn derive(content: AudioContent<'_>, format: AudioFormat, options: &AnalysisOptions) -> CacheKey {
    let digest = content.digest();
    let canonical = options.canonical_bytes();

    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update([0u8]);
    hasher.update(digest);
    hasher.update([format.tag()]);
    hasher.update((canonical.len() as u32).to_be_bytes());
    hasher.update(&canonical);

    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    CacheKey(key)
}

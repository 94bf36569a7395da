//! Cache entries and their durable encoding.
//!
//! Expiry metadata travels with the value so any reader, in any process,
//! can decide visibility on its own without trusting the store's native
//! expiry mechanism.

use chordgate_core::{CacheKey, Timestamp};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::DurableTierError;

/// Current durable value layout version.
const ENTRY_FORMAT_V1: u8 = 1;

/// `[version: 1][created_at: 8][expires_at: 8][last_access_at: 8]`
const HEADER_LEN: usize = 1 + 8 + 8 + 8;

/// A cached, serialized analysis result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Vec<u8>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub size_bytes: u64,
    pub last_access_at: Timestamp,
}

impl CacheEntry {
    /// Build an entry that expires `ttl` after `now`.
    pub fn new(key: CacheKey, value: Vec<u8>, now: Timestamp, ttl: Duration) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let size_bytes = value.len() as u64;
        Self {
            key,
            value,
            created_at: now,
            expires_at,
            size_bytes,
            last_access_at: now,
        }
    }

    /// An entry is visible strictly before its expiry instant.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: Timestamp) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn touch(&mut self, now: Timestamp) {
        if now > self.last_access_at {
            self.last_access_at = now;
        }
    }

    /// Footprint counted against a tier's byte cap.
    pub fn stored_size(&self) -> u64 {
        self.size_bytes + HEADER_LEN as u64
    }

    /// Encode the value with its expiry header.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.value.len());
        bytes.push(ENTRY_FORMAT_V1);
        bytes.extend_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&self.expires_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&self.last_access_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&self.value);
        bytes
    }

    /// Decode a stored value.
    pub fn decode(key: CacheKey, bytes: &[u8]) -> Result<Self, DurableTierError> {
        if bytes.len() < HEADER_LEN {
            return Err(DurableTierError::Corrupt {
                reason: format!("entry shorter than header ({} bytes)", bytes.len()),
            });
        }
        if bytes[0] != ENTRY_FORMAT_V1 {
            return Err(DurableTierError::Corrupt {
                reason: format!("unknown entry format {}", bytes[0]),
            });
        }

        let created_at = read_millis(&bytes[1..9])?;
        let expires_at = read_millis(&bytes[9..17])?;
        let last_access_at = read_millis(&bytes[17..25])?;
        let value = bytes[HEADER_LEN..].to_vec();
        let size_bytes = value.len() as u64;

        Ok(Self {
            key,
            value,
            created_at,
            expires_at,
            size_bytes,
            last_access_at,
        })
    }

    /// Read only the header fields used by eviction planning.
    pub(crate) fn decode_header(bytes: &[u8]) -> Option<(Timestamp, Timestamp)> {
        if bytes.len() < HEADER_LEN || bytes[0] != ENTRY_FORMAT_V1 {
            return None;
        }
        let expires_at = read_millis(&bytes[9..17]).ok()?;
        let last_access_at = read_millis(&bytes[17..25]).ok()?;
        Some((expires_at, last_access_at))
    }
}

fn read_millis(bytes: &[u8]) -> Result<Timestamp, DurableTierError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| DurableTierError::Corrupt {
        reason: "truncated timestamp".to_string(),
    })?;
    DateTime::from_timestamp_millis(i64::from_le_bytes(arr)).ok_or_else(|| {
        DurableTierError::Corrupt {
            reason: "timestamp out of range".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 32])
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_visible_until_expiry_instant() {
        let entry = CacheEntry::new(key(1), b"{}".to_vec(), t0(), Duration::from_secs(10));
        assert!(!entry.is_expired(t0() + ChronoDuration::milliseconds(9_999)));
        assert!(entry.is_expired(t0() + ChronoDuration::seconds(10)));
        assert!(entry.is_expired(t0() + ChronoDuration::seconds(11)));
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let entry = CacheEntry::new(key(1), vec![1, 2, 3], t0(), Duration::ZERO);
        assert!(entry.is_expired(t0()));
    }

    #[test]
    fn test_encode_decode_keeps_expiry() {
        let mut entry = CacheEntry::new(key(7), b"payload".to_vec(), t0(), Duration::from_secs(60));
        entry.touch(t0() + ChronoDuration::seconds(5));
        let decoded = CacheEntry::decode(key(7), &entry.encode()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(
            CacheEntry::decode_header(&entry.encode()),
            Some((entry.expires_at, entry.last_access_at))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CacheEntry::decode(key(1), &[1, 2, 3]).is_err());
        let mut bytes = CacheEntry::new(key(1), vec![], t0(), Duration::from_secs(1)).encode();
        bytes[0] = 99;
        assert!(CacheEntry::decode(key(1), &bytes).is_err());
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut entry = CacheEntry::new(key(1), vec![], t0(), Duration::from_secs(60));
        entry.touch(t0() - ChronoDuration::seconds(30));
        assert_eq!(entry.last_access_at, t0());
    }

    #[test]
    fn test_remaining_ttl() {
        let entry = CacheEntry::new(key(1), vec![], t0(), Duration::from_secs(60));
        assert_eq!(
            entry.remaining_ttl(t0() + ChronoDuration::seconds(20)),
            Duration::from_secs(40)
        );
        assert_eq!(
            entry.remaining_ttl(t0() + ChronoDuration::seconds(90)),
            Duration::ZERO
        );
    }
}

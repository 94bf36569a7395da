//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{ChordgateError, ChordgateResult, ConfigError, UnknownOptionPolicy};

const MIB: u64 = 1024 * 1024;

// ============================================================================
// ADMISSION
// ============================================================================

/// Bounded-concurrency gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Concurrency limit C. Also the worker pool size.
    pub max_concurrent: usize,
    /// Queue capacity Q: how many requests may wait for a slot.
    pub max_queue_size: usize,
    /// How long a queued request waits for a slot before rejection.
    pub admission_timeout: Duration,
    /// Retry hint when the queue is full.
    pub busy_retry_after: Duration,
    /// Retry hint when a queued request timed out.
    pub timeout_retry_after: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            admission_timeout: Duration::from_secs(30),
            busy_retry_after: Duration::from_secs(60),
            timeout_retry_after: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-task execution deadline.
    pub task_deadline: Duration,
    /// Slack added on top of admission wait plus task deadline before a
    /// single-flight follower stops waiting.
    pub follower_wait_margin: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_deadline: Duration::from_secs(30),
            follower_wait_margin: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Two-tier cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub fast_max_entries: usize,
    pub fast_max_bytes: u64,
    /// Byte cap of the durable tier.
    pub durable_cap_bytes: u64,
    /// Bound on every durable-tier round trip.
    pub durable_timeout: Duration,
    /// How long the durable tier is skipped after a failure.
    pub durable_retry_after: Duration,
    /// Directory of the LMDB durable tier. `None` means fast tier only
    /// unless a durable tier is supplied programmatically.
    pub durable_path: Option<PathBuf>,
    /// LMDB map size. Must be at least the byte cap.
    pub durable_map_size_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            fast_max_entries: 1024,
            fast_max_bytes: 256 * MIB,
            durable_cap_bytes: 1024 * MIB,
            durable_timeout: Duration::from_millis(250),
            durable_retry_after: Duration::from_secs(5),
            durable_path: None,
            durable_map_size_bytes: 2048 * MIB,
        }
    }
}

// ============================================================================
// REQUEST
// ============================================================================

/// Request validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub max_audio_bytes: u64,
    pub unknown_options: UnknownOptionPolicy,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_audio_bytes: 100 * MIB,
            unknown_options: UnknownOptionPolicy::Reject,
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChordgateConfig {
    pub admission: AdmissionConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub request: RequestConfig,
}

impl ChordgateConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CHORDGATE_MAX_CONCURRENT`: concurrency limit (default: 10)
    /// - `CHORDGATE_MAX_QUEUE_SIZE`: queue capacity (default: 100)
    /// - `CHORDGATE_ADMISSION_TIMEOUT_MS`: admission wait (default: 30000)
    /// - `CHORDGATE_TASK_DEADLINE_MS`: per-task deadline (default: 30000)
    /// - `CHORDGATE_CACHE_TTL_SECS`: cache TTL (default: 86400)
    /// - `CHORDGATE_FAST_MAX_ENTRIES`: fast tier entry cap (default: 1024)
    /// - `CHORDGATE_FAST_MAX_BYTES`: fast tier byte cap (default: 256 MiB)
    /// - `CHORDGATE_DURABLE_CAP_MB`: durable tier byte cap (default: 1024)
    /// - `CHORDGATE_DURABLE_TIMEOUT_MS`: durable round-trip bound (default: 250)
    /// - `CHORDGATE_DURABLE_RETRY_AFTER_MS`: durable backoff window (default: 5000)
    /// - `CHORDGATE_CACHE_DIR`: LMDB directory (default: unset)
    /// - `CHORDGATE_MAX_AUDIO_MB`: payload limit (default: 100)
    /// - `CHORDGATE_UNKNOWN_OPTIONS`: `reject` or `ignore` (default: reject)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let durable_cap_bytes = env_parse::<u64>("CHORDGATE_DURABLE_CAP_MB")
            .map(|mb| mb.saturating_mul(MIB))
            .unwrap_or(defaults.cache.durable_cap_bytes);

        Self {
            admission: AdmissionConfig {
                max_concurrent: env_parse("CHORDGATE_MAX_CONCURRENT")
                    .unwrap_or(defaults.admission.max_concurrent),
                max_queue_size: env_parse("CHORDGATE_MAX_QUEUE_SIZE")
                    .unwrap_or(defaults.admission.max_queue_size),
                admission_timeout: env_millis("CHORDGATE_ADMISSION_TIMEOUT_MS")
                    .unwrap_or(defaults.admission.admission_timeout),
                ..defaults.admission
            },
            worker: WorkerConfig {
                task_deadline: env_millis("CHORDGATE_TASK_DEADLINE_MS")
                    .unwrap_or(defaults.worker.task_deadline),
                ..defaults.worker
            },
            cache: CacheConfig {
                ttl: env_parse::<u64>("CHORDGATE_CACHE_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cache.ttl),
                fast_max_entries: env_parse("CHORDGATE_FAST_MAX_ENTRIES")
                    .unwrap_or(defaults.cache.fast_max_entries),
                fast_max_bytes: env_parse("CHORDGATE_FAST_MAX_BYTES")
                    .unwrap_or(defaults.cache.fast_max_bytes),
                durable_cap_bytes,
                durable_timeout: env_millis("CHORDGATE_DURABLE_TIMEOUT_MS")
                    .unwrap_or(defaults.cache.durable_timeout),
                durable_retry_after: env_millis("CHORDGATE_DURABLE_RETRY_AFTER_MS")
                    .unwrap_or(defaults.cache.durable_retry_after),
                durable_path: std::env::var("CHORDGATE_CACHE_DIR")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                durable_map_size_bytes: defaults
                    .cache
                    .durable_map_size_bytes
                    .max(durable_cap_bytes.saturating_mul(2)),
            },
            request: RequestConfig {
                max_audio_bytes: env_parse::<u64>("CHORDGATE_MAX_AUDIO_MB")
                    .map(|mb| mb.saturating_mul(MIB))
                    .unwrap_or(defaults.request.max_audio_bytes),
                unknown_options: env_parse("CHORDGATE_UNKNOWN_OPTIONS")
                    .unwrap_or(defaults.request.unknown_options),
            },
        }
    }

    pub fn with_admission(mut self, max_concurrent: usize, max_queue_size: usize) -> Self {
        self.admission.max_concurrent = max_concurrent;
        self.admission.max_queue_size = max_queue_size;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission.admission_timeout = timeout;
        self
    }

    pub fn with_task_deadline(mut self, deadline: Duration) -> Self {
        self.worker.task_deadline = deadline;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }

    pub fn with_durable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache.durable_path = Some(path.into());
        self
    }

    pub fn with_unknown_options(mut self, policy: UnknownOptionPolicy) -> Self {
        self.request.unknown_options = policy;
        self
    }

    /// Upper bound on how long a single-flight follower waits for the owner:
    /// the owner's worst case (admission wait plus task deadline) plus margin.
    pub fn follower_wait(&self) -> Duration {
        self.admission
            .admission_timeout
            .saturating_add(self.worker.task_deadline)
            .saturating_add(self.worker.follower_wait_margin)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - concurrency limit and fast-tier capacity are non-zero
    /// - task deadline, TTL and durable timeout are positive
    /// - the follower wait margin covers two durable round trips
    /// - the LMDB map can hold the durable byte cap
    /// - the payload limit is non-zero
    pub fn validate(&self) -> ChordgateResult<()> {
        if self.admission.max_concurrent == 0 {
            return Err(invalid(
                "admission.max_concurrent",
                self.admission.max_concurrent.to_string(),
                "max_concurrent must be greater than 0",
            ));
        }

        if self.worker.task_deadline.is_zero() {
            return Err(invalid(
                "worker.task_deadline",
                format!("{:?}", self.worker.task_deadline),
                "task_deadline must be positive",
            ));
        }

        if self.cache.ttl.is_zero() {
            return Err(invalid(
                "cache.ttl",
                format!("{:?}", self.cache.ttl),
                "ttl must be positive",
            ));
        }

        if self.cache.fast_max_entries == 0 || self.cache.fast_max_bytes == 0 {
            return Err(invalid(
                "cache.fast_max_entries",
                format!(
                    "{} entries / {} bytes",
                    self.cache.fast_max_entries, self.cache.fast_max_bytes
                ),
                "fast tier capacity must be greater than 0",
            ));
        }

        if self.cache.durable_timeout.is_zero() {
            return Err(invalid(
                "cache.durable_timeout",
                format!("{:?}", self.cache.durable_timeout),
                "durable_timeout must be positive",
            ));
        }

        // The owner may spend a durable write and a durable remove after its
        // task returns; followers must still be waiting when it publishes.
        let owner_cache_work = self.cache.durable_timeout.saturating_mul(2);
        if self.worker.follower_wait_margin < owner_cache_work {
            return Err(invalid(
                "worker.follower_wait_margin",
                format!("{:?}", self.worker.follower_wait_margin),
                &format!(
                    "follower_wait_margin must be at least twice durable_timeout ({:?})",
                    owner_cache_work
                ),
            ));
        }

        if self.cache.durable_map_size_bytes < self.cache.durable_cap_bytes {
            return Err(invalid(
                "cache.durable_map_size_bytes",
                self.cache.durable_map_size_bytes.to_string(),
                "map size must be at least durable_cap_bytes",
            ));
        }

        if self.request.max_audio_bytes == 0 {
            return Err(invalid(
                "request.max_audio_bytes",
                self.request.max_audio_bytes.to_string(),
                "max_audio_bytes must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: &str) -> ChordgateError {
    ChordgateError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_mirror_service_settings() {
        let config = ChordgateConfig::default();
        assert_eq!(config.admission.max_concurrent, 10);
        assert_eq!(config.admission.max_queue_size, 100);
        assert_eq!(config.worker.task_deadline, Duration::from_secs(30));
        assert_eq!(config.cache.ttl, Duration::from_secs(86_400));
        assert_eq!(config.cache.durable_cap_bytes, 1024 * MIB);
        assert_eq!(config.request.max_audio_bytes, 100 * MIB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = ChordgateConfig::default().with_admission(0, 10);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ChordgateError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "admission.max_concurrent"
        ));
    }

    #[test]
    fn test_zero_queue_is_allowed() {
        let config = ChordgateConfig::default().with_admission(4, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_deadline_rejected() {
        let config = ChordgateConfig::default().with_task_deadline(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_map_size_must_hold_cap() {
        let mut config = ChordgateConfig::default();
        config.cache.durable_map_size_bytes = config.cache.durable_cap_bytes - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_follower_wait_covers_owner_worst_case() {
        let config = ChordgateConfig::default()
            .with_admission_timeout(Duration::from_secs(2))
            .with_task_deadline(Duration::from_secs(3));
        assert_eq!(
            config.follower_wait(),
            Duration::from_secs(2) + Duration::from_secs(3) + config.worker.follower_wait_margin
        );
    }

    #[test]
    fn test_follower_margin_must_cover_owner_cache_work() {
        let mut config = ChordgateConfig::default();
        config.cache.durable_timeout = Duration::from_millis(250);

        config.worker.follower_wait_margin = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ChordgateError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "worker.follower_wait_margin"
        ));

        config.worker.follower_wait_margin = Duration::from_millis(499);
        assert!(config.validate().is_err());

        config.worker.follower_wait_margin = Duration::from_millis(500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_without_variables_is_default_shaped() {
        // Only checks values no test in this crate sets.
        let config = ChordgateConfig::from_env();
        assert_eq!(config.admission.busy_retry_after, Duration::from_secs(60));
        assert_eq!(config.admission.timeout_retry_after, Duration::from_secs(30));
        assert!(config.cache.durable_map_size_bytes >= config.cache.durable_cap_bytes);
    }
}

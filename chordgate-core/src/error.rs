//! Error types for chordgate operations
//!
//! Every error is `Clone`: a single computation outcome is handed verbatim to
//! the single-flight owner and to all of its followers.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Bad input shape. Recovered locally and reported as a client error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unsupported audio format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Unknown option: {field}")]
    UnknownOption { field: String },

    #[error("Audio payload too large: {size_bytes} bytes exceeds limit of {max_bytes} bytes")]
    PayloadTooLarge { size_bytes: u64, max_bytes: u64 },
}

/// Category of a decoder failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeFailure {
    /// The payload could not be decoded at all.
    Corrupt,
    /// The payload is not the audio type it claims to be.
    InvalidFileType,
    /// The audio exceeds the decoder's duration limit.
    DurationTooLong,
    /// The payload was not valid transport encoding (base64).
    InvalidEncoding,
}

/// Decoder failure. Surfaced to the caller, never retried.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Audio decoding failed: {message}")]
pub struct DecodeError {
    pub failure: DecodeFailure,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl DecodeError {
    pub fn new(failure: DecodeFailure, message: impl Into<String>) -> Self {
        Self {
            failure,
            message: message.into(),
            details: None,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(DecodeFailure::Corrupt, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Analysis engine failure during computation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Analysis failed: {reason}")]
    Failed { reason: String },

    #[error("Detector not available for model {model}")]
    DetectorUnavailable { model: String },

    #[error("Analysis engine panicked: {reason}")]
    EnginePanic { reason: String },

    #[error("Analysis cancelled")]
    Cancelled,
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Every slot is busy and the wait queue is at capacity.
    QueueFull,
    /// Queued, but no slot freed up within the admission timeout.
    WaitTimeout,
    /// The controller is shutting down.
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::QueueFull => "queue full",
            RejectReason::WaitTimeout => "admission wait timed out",
            RejectReason::ShuttingDown => "shutting down",
        };
        write!(f, "{}", s)
    }
}

/// System overloaded. Carries a retry hint for the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Admission rejected ({reason}), retry after {}s", retry_after.as_secs())]
pub struct AdmissionRejected {
    pub reason: RejectReason,
    pub retry_after: Duration,
}

/// Where a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutStage {
    /// The task exceeded its execution deadline.
    Deadline,
    /// The task was cancelled by a shutdown signal.
    Shutdown,
    /// A single-flight follower gave up waiting for the owner.
    FollowerWait,
    /// The single-flight owner went away without publishing an outcome.
    OwnerAbandoned,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutStage::Deadline => "task deadline exceeded",
            TimeoutStage::Shutdown => "cancelled by shutdown",
            TimeoutStage::FollowerWait => "gave up waiting for in-flight computation",
            TimeoutStage::OwnerAbandoned => "in-flight computation was abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Deadline exceeded. Distinct from [`AnalysisError`] so callers can tell
/// "too slow" from "wrong input".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Task timed out after {}ms: {stage}", limit.as_millis())]
pub struct TaskTimeout {
    pub stage: TimeoutStage,
    pub limit: Duration,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Internal storage failures that do reach the caller (the durable tier's
/// own errors never do).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage backend failed to open: {reason}")]
    Open { reason: String },
}

/// Master error type for all chordgate errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChordgateError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Decoding(#[from] DecodeError),

    #[error("{0}")]
    Analysis(#[from] AnalysisError),

    #[error("{0}")]
    AdmissionRejected(#[from] AdmissionRejected),

    #[error("{0}")]
    TaskTimeout(#[from] TaskTimeout),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl ChordgateError {
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Retry hint, present only for admission rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ChordgateError::AdmissionRejected(r) => Some(r.retry_after),
            _ => None,
        }
    }
}

/// Result type alias for chordgate operations.
pub type ChordgateResult<T> = Result<T, ChordgateError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_payload_too_large() {
        let err = ValidationError::PayloadTooLarge {
            size_bytes: 200,
            max_bytes: 100,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("200"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_admission_rejected_display() {
        let err = AdmissionRejected {
            reason: RejectReason::QueueFull,
            retry_after: Duration::from_secs(60),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("queue full"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_task_timeout_display() {
        let err = TaskTimeout {
            stage: TimeoutStage::Deadline,
            limit: Duration::from_millis(1500),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("1500ms"));
        assert!(msg.contains("deadline"));
    }

    #[test]
    fn test_decode_error_details() {
        let err = DecodeError::corrupt("bad header")
            .with_details(serde_json::json!({"offset": 12}));
        assert_eq!(err.failure, DecodeFailure::Corrupt);
        assert_eq!(err.details.unwrap()["offset"], 12);
    }

    #[test]
    fn test_chordgate_error_from_variants() {
        let validation = ChordgateError::from(ValidationError::RequiredFieldMissing {
            field: "audio".to_string(),
        });
        assert!(matches!(validation, ChordgateError::Validation(_)));

        let analysis = ChordgateError::from(AnalysisError::Cancelled);
        assert!(matches!(analysis, ChordgateError::Analysis(_)));

        let timeout = ChordgateError::from(TaskTimeout {
            stage: TimeoutStage::Shutdown,
            limit: Duration::ZERO,
        });
        assert!(matches!(timeout, ChordgateError::TaskTimeout(_)));
        assert_eq!(timeout.retry_after(), None);

        let rejected = ChordgateError::from(AdmissionRejected {
            reason: RejectReason::WaitTimeout,
            retry_after: Duration::from_secs(30),
        });
        assert_eq!(rejected.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_errors_clone_equal() {
        let err = ChordgateError::from(AnalysisError::Failed {
            reason: "silence".to_string(),
        });
        assert_eq!(err.clone(), err);
    }
}

//! Caller-facing error representation.
//!
//! Every failure leaving the coordinator is a [`RequestError`], which renders
//! to an [`ErrorResponse`] with a stable [`ErrorCode`], a message, a details
//! object and the caller's correlation id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;

use crate::{
    AnalysisError, ChordgateError, CorrelationId, DecodeFailure, TimeoutStage, ValidationError,
};

// ============================================================================
// ERROR CODES
// ============================================================================

/// Stable error codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Client errors
    // ========================================================================
    ValidationError,
    MissingField,
    FileTooLarge,
    InvalidOption,
    UnsupportedFormat,
    DecodingError,
    AnalysisError,

    // ========================================================================
    // Load and timing
    // ========================================================================
    ServerBusy,
    ShuttingDown,
    Timeout,

    // ========================================================================
    // Server errors
    // ========================================================================
    EnginePanic,
    InternalError,
}

impl ErrorCode {
    /// HTTP-equivalent status for this code.
    ///
    /// `Timeout` defaults to 408; a follower that gave up waiting reports 504
    /// through [`ErrorResponse::status`].
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError
            | ErrorCode::MissingField
            | ErrorCode::FileTooLarge
            | ErrorCode::InvalidOption
            | ErrorCode::UnsupportedFormat
            | ErrorCode::DecodingError => 400,

            ErrorCode::AnalysisError => 422,

            ErrorCode::ServerBusy | ErrorCode::ShuttingDown => 503,

            ErrorCode::Timeout => 408,

            ErrorCode::EnginePanic | ErrorCode::InternalError => 500,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "Request validation failed",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::FileTooLarge => "Audio payload exceeds the size limit",
            ErrorCode::InvalidOption => "Unrecognised analysis option",
            ErrorCode::UnsupportedFormat => "Unsupported audio format",
            ErrorCode::DecodingError => "Audio could not be decoded",
            ErrorCode::AnalysisError => "Audio analysis failed",
            ErrorCode::ServerBusy => "Server is busy, retry later",
            ErrorCode::ShuttingDown => "Server is shutting down",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::EnginePanic => "Analysis engine crashed",
            ErrorCode::InternalError => "Internal server error",
        }
    }

    /// The SCREAMING_SNAKE_CASE wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::MissingField => "MISSING_FIELD",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::InvalidOption => "INVALID_OPTION",
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::DecodingError => "DECODING_ERROR",
            ErrorCode::AnalysisError => "ANALYSIS_ERROR",
            ErrorCode::ServerBusy => "SERVER_BUSY",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::EnginePanic => "ENGINE_PANIC",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// REQUEST ERROR
// ============================================================================

/// A failure bound to the request that observed it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestError {
    /// The caller's correlation id.
    pub correlation_id: CorrelationId,
    /// Correlation id of the single-flight owner, when the outcome was shared
    /// from another request's computation.
    pub origin_correlation_id: Option<CorrelationId>,
    pub error: ChordgateError,
}

impl RequestError {
    pub fn new(correlation_id: CorrelationId, error: impl Into<ChordgateError>) -> Self {
        Self {
            correlation_id,
            origin_correlation_id: None,
            error: error.into(),
        }
    }

    pub fn with_origin(mut self, origin: CorrelationId) -> Self {
        if origin != self.correlation_id {
            self.origin_correlation_id = Some(origin);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        error_code(&self.error)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.error.retry_after()
    }

    pub fn to_response(&self) -> ErrorResponse {
        let code = self.code();
        let mut details = error_details(&self.error);
        if let Some(origin) = self.origin_correlation_id {
            details.insert(
                "origin_correlation_id".to_string(),
                Value::String(origin.to_string()),
            );
        }

        let status = match &self.error {
            ChordgateError::TaskTimeout(t)
                if matches!(t.stage, TimeoutStage::FollowerWait | TimeoutStage::OwnerAbandoned) =>
            {
                504
            }
            _ => code.status_code(),
        };

        ErrorResponse {
            error_code: code,
            message: self.error.to_string(),
            details: Value::Object(details),
            correlation_id: self.correlation_id,
            retry_after: self.retry_after().map(|d| d.as_secs().max(1)),
            status,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.correlation_id, self.error)
    }
}

impl std::error::Error for RequestError {}

impl From<RequestError> for ErrorResponse {
    fn from(err: RequestError) -> Self {
        err.to_response()
    }
}

/// Map an error to its stable code.
pub fn error_code(error: &ChordgateError) -> ErrorCode {
    match error {
        ChordgateError::Validation(v) => match v {
            ValidationError::RequiredFieldMissing { .. } => ErrorCode::MissingField,
            ValidationError::InvalidValue { .. } => ErrorCode::ValidationError,
            ValidationError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            ValidationError::UnknownOption { .. } => ErrorCode::InvalidOption,
            ValidationError::PayloadTooLarge { .. } => ErrorCode::FileTooLarge,
        },
        ChordgateError::Decoding(_) => ErrorCode::DecodingError,
        ChordgateError::Analysis(a) => match a {
            AnalysisError::EnginePanic { .. } => ErrorCode::EnginePanic,
            AnalysisError::Cancelled => ErrorCode::Timeout,
            _ => ErrorCode::AnalysisError,
        },
        ChordgateError::AdmissionRejected(r) => match r.reason {
            crate::RejectReason::ShuttingDown => ErrorCode::ShuttingDown,
            _ => ErrorCode::ServerBusy,
        },
        ChordgateError::TaskTimeout(t) => match t.stage {
            TimeoutStage::Shutdown => ErrorCode::ShuttingDown,
            _ => ErrorCode::Timeout,
        },
        ChordgateError::Config(_) | ChordgateError::Storage(_) | ChordgateError::Internal { .. } => {
            ErrorCode::InternalError
        }
    }
}

fn error_details(error: &ChordgateError) -> Map<String, Value> {
    let details = match error {
        ChordgateError::Validation(v) => match v {
            ValidationError::RequiredFieldMissing { field }
            | ValidationError::UnknownOption { field } => json!({ "field": field }),
            ValidationError::InvalidValue { field, reason } => {
                json!({ "field": field, "reason": reason })
            }
            ValidationError::UnsupportedFormat { format } => json!({
                "format": format,
                "supported_formats": crate::AudioFormat::ALL.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            }),
            ValidationError::PayloadTooLarge {
                size_bytes,
                max_bytes,
            } => json!({ "size_bytes": size_bytes, "max_bytes": max_bytes }),
        },
        ChordgateError::Decoding(d) => {
            let mut map = json!({ "failure": decode_failure_name(d.failure) });
            if let (Some(extra), Some(obj)) = (&d.details, map.as_object_mut()) {
                obj.insert("decoder".to_string(), extra.clone());
            }
            map
        }
        ChordgateError::AdmissionRejected(r) => json!({
            "reason": r.reason.to_string(),
            "retry_after_secs": r.retry_after.as_secs(),
        }),
        ChordgateError::TaskTimeout(t) => json!({
            "stage": t.stage.to_string(),
            "limit_ms": t.limit.as_millis() as u64,
        }),
        _ => json!({}),
    };

    match details {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn decode_failure_name(failure: DecodeFailure) -> &'static str {
    match failure {
        DecodeFailure::Corrupt => "corrupt",
        DecodeFailure::InvalidFileType => "invalid_file_type",
        DecodeFailure::DurationTooLong => "duration_too_long",
        DecodeFailure::InvalidEncoding => "invalid_encoding",
    }
}

// ============================================================================
// ERROR RESPONSE
// ============================================================================

/// Serializable error body handed to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub correlation_id: CorrelationId,
    /// Seconds the caller should wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// HTTP-equivalent status.
    pub status: u16,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdmissionRejected, DecodeError, RejectReason, TaskTimeout};

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ServerBusy).unwrap();
        assert_eq!(json, "\"SERVER_BUSY\"");
        assert_eq!(ErrorCode::FileTooLarge.as_str(), "FILE_TOO_LARGE");
    }

    #[test]
    fn test_server_busy_carries_retry_after() {
        let id = CorrelationId::new();
        let err = RequestError::new(
            id,
            AdmissionRejected {
                reason: RejectReason::QueueFull,
                retry_after: Duration::from_secs(60),
            },
        );
        let resp = err.to_response();
        assert_eq!(resp.error_code, ErrorCode::ServerBusy);
        assert_eq!(resp.status, 503);
        assert_eq!(resp.retry_after, Some(60));
        assert_eq!(resp.correlation_id, id);
        assert_eq!(resp.details["reason"], "queue full");
    }

    #[test]
    fn test_shared_outcome_names_origin() {
        let caller = CorrelationId::new();
        let owner = CorrelationId::new();
        let err = RequestError::new(
            caller,
            AnalysisError::Failed {
                reason: "silent input".to_string(),
            },
        )
        .with_origin(owner);
        let resp = err.to_response();
        assert_eq!(resp.error_code, ErrorCode::AnalysisError);
        assert_eq!(resp.status, 422);
        assert_eq!(resp.details["origin_correlation_id"], owner.to_string());
    }

    #[test]
    fn test_origin_equal_to_caller_is_omitted() {
        let id = CorrelationId::new();
        let err = RequestError::new(id, AnalysisError::Cancelled).with_origin(id);
        assert!(err.origin_correlation_id.is_none());
    }

    #[test]
    fn test_timeout_statuses() {
        let id = CorrelationId::new();
        let deadline = RequestError::new(
            id,
            TaskTimeout {
                stage: TimeoutStage::Deadline,
                limit: Duration::from_secs(30),
            },
        )
        .to_response();
        assert_eq!(deadline.error_code, ErrorCode::Timeout);
        assert_eq!(deadline.status, 408);

        let follower = RequestError::new(
            id,
            TaskTimeout {
                stage: TimeoutStage::FollowerWait,
                limit: Duration::from_secs(61),
            },
        )
        .to_response();
        assert_eq!(follower.error_code, ErrorCode::Timeout);
        assert_eq!(follower.status, 504);
    }

    #[test]
    fn test_validation_codes() {
        let id = CorrelationId::new();
        let missing = RequestError::new(
            id,
            ValidationError::RequiredFieldMissing {
                field: "audio".to_string(),
            },
        );
        assert_eq!(missing.code(), ErrorCode::MissingField);

        let unsupported = RequestError::new(
            id,
            ValidationError::UnsupportedFormat {
                format: "aiff".to_string(),
            },
        )
        .to_response();
        assert_eq!(unsupported.error_code, ErrorCode::UnsupportedFormat);
        assert_eq!(unsupported.details["supported_formats"][0], "wav");
    }

    #[test]
    fn test_decode_error_details() {
        let err = RequestError::new(
            CorrelationId::new(),
            DecodeError::corrupt("truncated frame").with_details(json!({"frame": 3})),
        )
        .to_response();
        assert_eq!(err.error_code, ErrorCode::DecodingError);
        assert_eq!(err.details["failure"], "corrupt");
        assert_eq!(err.details["decoder"]["frame"], 3);
    }

    #[test]
    fn test_engine_panic_is_server_error() {
        let err = RequestError::new(
            CorrelationId::new(),
            AnalysisError::EnginePanic {
                reason: "index out of bounds".to_string(),
            },
        );
        assert_eq!(err.to_response().status, 500);
    }

    #[test]
    fn test_response_json_shape() {
        let resp = RequestError::new(CorrelationId::new(), AnalysisError::Cancelled).to_response();
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error_code"], "TIMEOUT");
        assert!(json.get("retry_after").is_none());
        assert!(json["details"].is_object());
    }
}

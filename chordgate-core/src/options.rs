//! Closed, versioned analysis options and audio formats.
//!
//! Every recognised option is listed here together with its effect on the
//! cache key. Anything else in a request's options object is handled by an
//! explicit [`UnknownOptionPolicy`], never hashed opportunistically.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ValidationError;

/// Version of the options record. Hashed into every cache key so a change to
/// option semantics can never serve results computed under the old meaning.
pub const OPTIONS_VERSION: u16 = 1;

// ============================================================================
// AUDIO FORMAT
// ============================================================================

/// Declared encoding of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Flac,
    Ogg,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 4] = [
        AudioFormat::Wav,
        AudioFormat::Mp3,
        AudioFormat::Flac,
        AudioFormat::Ogg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
        }
    }

    /// Stable single-byte tag used in cache-key derivation.
    ///
    /// Tags are part of the persisted key space: never renumber them.
    pub fn tag(&self) -> u8 {
        match self {
            AudioFormat::Wav => 1,
            AudioFormat::Mp3 => 2,
            AudioFormat::Flac => 3,
            AudioFormat::Ogg => 4,
        }
    }

    /// Parse a user-supplied format name (case-insensitive).
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(AudioFormat::Wav),
            "mp3" => Ok(AudioFormat::Mp3),
            "flac" => Ok(AudioFormat::Flac),
            "ogg" => Ok(AudioFormat::Ogg),
            _ => Err(ValidationError::UnsupportedFormat {
                format: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// MODEL TIER
// ============================================================================

/// Detector tier used for chord, tempo and key detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Basic,
    Advanced,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Basic => "basic",
            ModelTier::Advanced => "advanced",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            ModelTier::Basic => 1,
            ModelTier::Advanced => 2,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// OPTIONS RECORD
// ============================================================================

/// What to do with option fields this version does not recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownOptionPolicy {
    /// Fail validation, naming the offending field.
    #[default]
    Reject,
    /// Drop the field. It never reaches the engine or the cache key.
    Ignore,
}

impl FromStr for UnknownOptionPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(UnknownOptionPolicy::Reject),
            "ignore" => Ok(UnknownOptionPolicy::Ignore),
            other => Err(ValidationError::InvalidValue {
                field: "unknown_option_policy".to_string(),
                reason: format!("expected 'reject' or 'ignore', got '{}'", other),
            }),
        }
    }
}

/// Analysis options.
///
/// | field                 | affects analysis | affects key                  |
/// |-----------------------|------------------|------------------------------|
/// | `model`               | yes              | yes                          |
/// | `seventh_chords`      | advanced only    | only when `model = advanced` |
/// | `include_performance` | no               | no                           |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub model: ModelTier,
    /// Emit seventh-chord labels (`G7`, `Cmaj7`). Honoured by the advanced tier.
    pub seventh_chords: bool,
    /// Include `processing_info` in the response. Presentation only.
    pub include_performance: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            model: ModelTier::Basic,
            seventh_chords: true,
            include_performance: true,
        }
    }
}

const KNOWN_FIELDS: [&str; 3] = ["model", "seventh_chords", "include_performance"];

impl AnalysisOptions {
    pub fn with_model(mut self, model: ModelTier) -> Self {
        self.model = model;
        self
    }

    pub fn with_seventh_chords(mut self, enabled: bool) -> Self {
        self.seventh_chords = enabled;
        self
    }

    pub fn with_include_performance(mut self, enabled: bool) -> Self {
        self.include_performance = enabled;
        self
    }

    /// Top-level fields of an options object that are not recognized.
    pub fn unknown_fields(value: &serde_json::Value) -> Vec<String> {
        match value {
            serde_json::Value::Object(map) => map
                .keys()
                .filter(|k| !KNOWN_FIELDS.contains(&k.as_str()))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Parse the options object of a request.
    ///
    /// `null` is treated as an empty object. Omitted fields take their
    /// defaults, so `{}` and `{"model": "basic"}` are the same options.
    pub fn from_json(
        value: &serde_json::Value,
        policy: UnknownOptionPolicy,
    ) -> Result<Self, ValidationError> {
        let map = match value {
            serde_json::Value::Null => return Ok(Self::default()),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(ValidationError::InvalidValue {
                    field: "options".to_string(),
                    reason: format!("expected an object, got {}", json_type_name(other)),
                })
            }
        };

        if policy == UnknownOptionPolicy::Reject {
            if let Some(field) = map.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str())) {
                return Err(ValidationError::UnknownOption {
                    field: field.clone(),
                });
            }
        }

        let mut options = Self::default();

        if let Some(model) = map.get("model") {
            options.model = match model.as_str().map(|s| s.trim().to_ascii_lowercase()) {
                Some(s) if s == "basic" => ModelTier::Basic,
                Some(s) if s == "advanced" => ModelTier::Advanced,
                _ => {
                    return Err(ValidationError::InvalidValue {
                        field: "options.model".to_string(),
                        reason: format!("expected 'basic' or 'advanced', got {}", model),
                    })
                }
            };
        }

        if let Some(value) = map.get("seventh_chords") {
            options.seventh_chords = expect_bool("options.seventh_chords", value)?;
        }

        if let Some(value) = map.get("include_performance") {
            options.include_performance = expect_bool("options.include_performance", value)?;
        }

        Ok(options)
    }

    /// Canonical byte encoding of every field that affects the analysis
    /// outcome. Fields with no effect for the chosen model are encoded as
    /// their defaults so semantically identical requests share a key.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let seventh = match self.model {
            ModelTier::Advanced => self.seventh_chords,
            ModelTier::Basic => AnalysisOptions::default().seventh_chords,
        };

        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&OPTIONS_VERSION.to_be_bytes());
        out.push(b'm');
        out.push(self.model.tag());
        out.push(b's');
        out.push(u8::from(seventh));
        out
    }
}

fn expect_bool(field: &str, value: &serde_json::Value) -> Result<bool, ValidationError> {
    value.as_bool().ok_or_else(|| ValidationError::InvalidValue {
        field: field.to_string(),
        reason: format!("expected a boolean, got {}", json_type_name(value)),
    })
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

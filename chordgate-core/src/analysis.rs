//! Analysis data model and the collaborator contracts.
//!
//! The decoder and the analysis engine are external, CPU-bound, synchronous
//! functions. Chordgate only schedules them; it never looks inside.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{AnalysisError, AnalysisOptions, AudioFormat, DecodeError};

/// Version of the serialized result schema.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// A single chord detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordEntry {
    /// Position in seconds.
    pub time: f64,
    /// Chord label, e.g. `C`, `G7`, `Dm`.
    pub label: String,
    /// Confidence in `[0, 1]`, when the detector reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl ChordEntry {
    pub fn new(time: f64, label: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            time,
            label: label.into(),
            confidence,
        }
    }
}

/// Per-call processing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Seconds spent producing this result.
    pub processing_time: f64,
    pub model_used: String,
}

/// Musical features extracted from one audio payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub schema_version: String,
    #[serde(default)]
    pub key: Option<String>,
    /// Beats per minute.
    #[serde(default)]
    pub tempo: Option<f64>,
    /// Time-ordered chord timeline.
    pub chords: Vec<ChordEntry>,
    /// Duration of the audio in seconds.
    pub duration: f64,
    #[serde(default)]
    pub processing_info: Option<ProcessingInfo>,
}

impl AnalysisResult {
    /// Chords sorted by time. Engines are expected to emit them ordered; this
    /// is applied before a result is cached so stored timelines always are.
    pub fn with_sorted_chords(mut self) -> Self {
        self.chords
            .sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
        self
    }

    /// Musical content equality, ignoring processing metadata.
    pub fn same_content(&self, other: &AnalysisResult) -> bool {
        self.key == other.key
            && self.tempo == other.tempo
            && self.chords == other.chords
            && self.duration == other.duration
    }
}

/// Normalized PCM produced by the decoder.
///
/// Samples are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let frames = self.samples.len() as f64 / f64::from(self.channels);
        frames / f64::from(self.sample_rate)
    }
}

/// Converts an encoded payload into normalized PCM.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], format: AudioFormat) -> Result<DecodedAudio, DecodeError>;
}

/// Deterministic musical-feature extraction.
///
/// Implementations should check `cancel` between stages; once it fires the
/// caller has already given up and the result will be discarded.
pub trait AnalysisEngine: Send + Sync {
    fn analyze(
        &self,
        audio: &DecodedAudio,
        options: &AnalysisOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError>;
}

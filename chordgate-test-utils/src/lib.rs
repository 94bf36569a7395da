//! CHORDGATE Test Utilities
//!
//! Shared test infrastructure for the chordgate workspace:
//! - Mock decoder and analysis engine (counting, slow, failing, panicking,
//!   gated, cancellable)
//! - Durable tiers that fail or stall on demand
//! - Fixtures for requests, audio and configuration
//! - Proptest generators and custom assertions

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

pub use chordgate_core::{
    AnalysisEngine, AnalysisError, AnalysisOptions, AnalysisResult, AudioDecoder, AudioFormat,
    CacheKey, ChordEntry, ChordgateConfig, ChordgateError, CorrelationId, DecodeError,
    DecodedAudio, ErrorCode, ManualClock, ModelTier, ProcessingInfo, RequestError, Timestamp,
    SCHEMA_VERSION,
};
pub use chordgate_storage::{
    CacheEntry, CacheStats, DurableTier, DurableTierError, InMemoryDurableTier, PutOutcome,
};

/// Sample rate reported by [`MockDecoder`].
pub const MOCK_SAMPLE_RATE: u32 = 44_100;

// ============================================================================
// MOCK DECODER
// ============================================================================

/// Decoder that maps each byte to one sample.
///
/// Payloads starting with `CORRUPT` fail with a corrupt-audio error.
#[derive(Debug, Default)]
pub struct MockDecoder {
    calls: AtomicUsize,
}

impl MockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AudioDecoder for MockDecoder {
    fn decode(&self, bytes: &[u8], _format: AudioFormat) -> Result<DecodedAudio, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if bytes.starts_with(b"CORRUPT") {
            return Err(DecodeError::corrupt("Could not decode audio file"));
        }
        let samples = bytes
            .iter()
            .map(|b| (f32::from(*b) - 128.0) / 128.0)
            .collect();
        Ok(DecodedAudio::new(samples, MOCK_SAMPLE_RATE, 1))
    }
}

// ============================================================================
// MOCK ENGINE
// ============================================================================

/// What [`MockEngine`] does once it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EngineBehaviour {
    #[default]
    Succeed,
    Fail(String),
    Panic(String),
    /// Spin until the task is cancelled.
    Hang,
}

#[derive(Debug, Default)]
struct Gate {
    closed: Mutex<bool>,
    opened: Condvar,
}

/// Analysis engine with scripted behaviour and invocation counters.
///
/// Output for the basic tier is `C F G C`; the advanced tier with seventh
/// chords yields `Cmaj7 Fmaj7 G7 Cmaj7`. Chords are emitted out of order so
/// callers exercise the time sort.
#[derive(Debug, Default)]
pub struct MockEngine {
    behaviour: Mutex<EngineBehaviour>,
    delay: Mutex<Duration>,
    gate: Gate,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    cancelled: AtomicUsize,
}

/// Decrements the running count on every exit, panics included.
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: EngineBehaviour) -> Self {
        let engine = Self::default();
        engine.set_behaviour(behaviour);
        engine
    }

    /// Sleep this long (cooperatively) before producing output.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn set_behaviour(&self, behaviour: EngineBehaviour) {
        *self.behaviour.lock() = behaviour;
    }

    /// Block every invocation until [`MockEngine::release`].
    pub fn hold(&self) {
        *self.gate.closed.lock() = true;
    }

    pub fn release(&self) {
        *self.gate.closed.lock() = false;
        self.gate.opened.notify_all();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    /// Invocations that stopped because their token was cancelled.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn wait_at_gate(&self, cancel: &CancellationToken) -> Result<(), AnalysisError> {
        let mut closed = self.gate.closed.lock();
        while *closed {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            self.gate
                .opened
                .wait_for(&mut closed, Duration::from_millis(5));
        }
        Ok(())
    }

    fn sleep_cooperatively(
        &self,
        total: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        let deadline = std::time::Instant::now() + total;
        while std::time::Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn output(audio: &DecodedAudio, options: &AnalysisOptions) -> AnalysisResult {
        let (labels, confidence) = match (options.model, options.seventh_chords) {
            (ModelTier::Advanced, true) => (["Cmaj7", "Fmaj7", "G7", "Cmaj7"], 0.9),
            (ModelTier::Advanced, false) => (["C", "F", "G", "C"], 0.9),
            (ModelTier::Basic, _) => (["C", "F", "G", "C"], 0.8),
        };
        // Emitted out of time order.
        let chords = [3usize, 0, 2, 1]
            .iter()
            .map(|&i| ChordEntry::new(i as f64, labels[i], Some(confidence)))
            .collect();

        AnalysisResult {
            schema_version: SCHEMA_VERSION.to_string(),
            key: Some("C major".to_string()),
            tempo: Some(120.0),
            chords,
            duration: audio.duration_secs(),
            processing_info: Some(ProcessingInfo {
                sample_rate: audio.sample_rate,
                channels: audio.channels,
                processing_time: 0.0,
                model_used: options.model.as_str().to_string(),
            }),
        }
    }
}

impl AnalysisEngine for MockEngine {
    fn analyze(
        &self,
        audio: &DecodedAudio,
        options: &AnalysisOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let behaviour = self.behaviour.lock().clone();
        let delay = *self.delay.lock();

        let outcome = self
            .wait_at_gate(cancel)
            .and_then(|_| self.sleep_cooperatively(delay, cancel));
        if let Err(e) = outcome {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        match behaviour {
            EngineBehaviour::Succeed => Ok(Self::output(audio, options)),
            EngineBehaviour::Fail(reason) => Err(AnalysisError::Failed { reason }),
            EngineBehaviour::Panic(message) => panic!("{}", message),
            EngineBehaviour::Hang => {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(AnalysisError::Cancelled)
            }
        }
    }
}

// ============================================================================
// FAULTY DURABLE TIERS
// ============================================================================

/// Durable tier that fails every call while switched off.
#[derive(Debug, Clone)]
pub struct FlakyDurableTier {
    inner: InMemoryDurableTier,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FlakyDurableTier {
    pub fn new(inner: InMemoryDurableTier) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryDurableTier {
        &self.inner
    }

    fn check(&self) -> Result<(), DurableTierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(DurableTierError::Unavailable {
                reason: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableTier for FlakyDurableTier {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(
        &self,
        key: &CacheKey,
        now: Timestamp,
    ) -> Result<Option<CacheEntry>, DurableTierError> {
        self.check()?;
        self.inner.get(key, now).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, DurableTierError> {
        self.check()?;
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, DurableTierError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, DurableTierError> {
        self.check()?;
        self.inner.purge_expired(now).await
    }

    async fn stats(&self) -> Result<CacheStats, DurableTierError> {
        self.check()?;
        self.inner.stats().await
    }
}

/// Durable tier whose every call takes `delay` before delegating.
#[derive(Debug, Clone)]
pub struct SlowDurableTier {
    inner: InMemoryDurableTier,
    delay: Duration,
}

impl SlowDurableTier {
    pub fn new(inner: InMemoryDurableTier, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl DurableTier for SlowDurableTier {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn get(
        &self,
        key: &CacheKey,
        now: Timestamp,
    ) -> Result<Option<CacheEntry>, DurableTierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key, now).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, DurableTierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, DurableTierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.remove(key).await
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, DurableTierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.purge_expired(now).await
    }

    async fn stats(&self) -> Result<CacheStats, DurableTierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.stats().await
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built inputs for common scenarios.

    use super::*;

    /// Deterministic WAV-looking payload; different seeds give different
    /// content (and so different cache keys).
    pub fn wav_bytes(seed: u8, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len.max(12));
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(len as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        let mut state = u32::from(seed).wrapping_mul(2_654_435_761).wrapping_add(1);
        while bytes.len() < len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            bytes.push((state & 0xff) as u8);
        }
        bytes
    }

    /// A small default clip.
    pub fn audio_x() -> Vec<u8> {
        wav_bytes(42, 4_096)
    }

    /// Payload the mock decoder rejects.
    pub fn corrupt_audio() -> Vec<u8> {
        let mut bytes = b"CORRUPT".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        bytes
    }

    pub fn basic_options() -> serde_json::Value {
        serde_json::json!({ "model": "basic" })
    }

    pub fn advanced_options() -> serde_json::Value {
        serde_json::json!({ "model": "advanced", "seventh_chords": true })
    }

    /// Configuration with short timeouts suited to tests.
    pub fn test_config(max_concurrent: usize, max_queue_size: usize) -> ChordgateConfig {
        let mut config = ChordgateConfig::default()
            .with_admission(max_concurrent, max_queue_size)
            .with_admission_timeout(Duration::from_secs(10))
            .with_task_deadline(Duration::from_secs(10));
        config.worker.follower_wait_margin = Duration::from_secs(1);
        config.cache.durable_timeout = Duration::from_millis(200);
        config.cache.durable_retry_after = Duration::from_secs(60);
        config
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for chordgate inputs.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_audio_format() -> impl Strategy<Value = AudioFormat> {
        prop_oneof![
            Just(AudioFormat::Wav),
            Just(AudioFormat::Mp3),
            Just(AudioFormat::Flac),
            Just(AudioFormat::Ogg),
        ]
    }

    pub fn arb_model_tier() -> impl Strategy<Value = ModelTier> {
        prop_oneof![Just(ModelTier::Basic), Just(ModelTier::Advanced)]
    }

    pub fn arb_options() -> impl Strategy<Value = AnalysisOptions> {
        (arb_model_tier(), any::<bool>(), any::<bool>()).prop_map(|(model, seventh, perf)| {
            AnalysisOptions::default()
                .with_model(model)
                .with_seventh_chords(seventh)
                .with_include_performance(perf)
        })
    }

    /// The JSON object a client would send for `options`.
    pub fn arb_options_json() -> impl Strategy<Value = serde_json::Value> {
        arb_options().prop_map(|o| {
            serde_json::json!({
                "model": o.model.as_str(),
                "seventh_chords": o.seventh_chords,
                "include_performance": o.include_performance,
            })
        })
    }

    /// Non-empty audio payloads.
    pub fn arb_audio_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..2048)
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        any::<[u8; 32]>().prop_map(CacheKey::from_bytes)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for chordgate outcomes.

    use super::*;

    /// Assert that a request failed with the given code.
    #[track_caller]
    pub fn assert_error_code<T: std::fmt::Debug>(
        result: &Result<T, RequestError>,
        expected: ErrorCode,
    ) {
        match result {
            Err(e) => assert_eq!(e.code(), expected, "unexpected error: {}", e),
            Ok(v) => panic!("Expected {} error, got Ok: {:?}", expected, v),
        }
    }

    /// Assert that two results carry the same analysis content.
    #[track_caller]
    pub fn assert_same_content(a: &AnalysisResult, b: &AnalysisResult) {
        assert!(
            a.same_content(b),
            "results differ:\n{:?}\n{:?}",
            a.chords,
            b.chords
        );
    }

    /// Assert that chords are in non-decreasing time order.
    #[track_caller]
    pub fn assert_time_ordered(result: &AnalysisResult) {
        for pair in result.chords.windows(2) {
            assert!(
                pair[0].time <= pair[1].time,
                "chords out of order: {} before {}",
                pair[0].time,
                pair[1].time
            );
        }
    }
}

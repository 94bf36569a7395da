//! Request coordinator.
//!
//! Per request:
//!
//! 1. validate the payload and derive the cache key
//! 2. look the key up in the tiered cache; a hit returns at once
//! 3. on a miss, join or start the single flight for the key; the owner
//!    acquires an admission ticket, runs the task on the worker pool,
//!    releases the ticket and writes the result through the cache
//!
//! Only the owner writes the cache. Followers receive the owner's outcome,
//! success or failure, tagged with the owner's correlation id.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chordgate_core::{
    derive, system_clock, AnalysisEngine, AnalysisOptions, AnalysisResult, AudioContent,
    AudioDecoder, AudioFormat, CacheKey, ChordgateConfig, ChordgateError, ChordgateResult,
    ConfigError, CorrelationId, DecodeError, DecodeFailure, ErrorResponse, HealthCheck,
    HealthReport, RequestError, SharedClock, UnknownOptionPolicy, ValidationError,
};
use chordgate_storage::{
    CacheTier, DurableStatus, DurableTier, LmdbDurableTier, PurgeReport, TieredCache, TieredStats,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::admission::{AdmissionController, AdmissionStats};
use crate::single_flight::{FlightRole, SingleFlight, SingleFlightStats};
use crate::worker_pool::{AnalysisTask, WorkerPool, WorkerPoolStats};

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Audio payload as received from the API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Bytes(Vec<u8>),
    /// Standard base64 text.
    Base64(String),
}

impl From<Vec<u8>> for AudioSource {
    fn from(bytes: Vec<u8>) -> Self {
        AudioSource::Bytes(bytes)
    }
}

/// One analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub audio: AudioSource,
    pub format: String,
    /// Options object. `null` means all defaults.
    pub options: Value,
    /// Caller-supplied correlation id; generated when absent.
    pub correlation_id: Option<CorrelationId>,
}

impl AnalysisRequest {
    pub fn new(audio: impl Into<AudioSource>, format: impl Into<String>) -> Self {
        Self {
            audio: audio.into(),
            format: format.into(),
            options: Value::Null,
            correlation_id: None,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Where a response's result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    /// This request ran the analysis.
    Computed,
    FastTier,
    DurableTier,
    /// Shared from another request's in-flight computation.
    SharedFlight,
}

impl From<CacheTier> for ServedFrom {
    fn from(tier: CacheTier) -> Self {
        match tier {
            CacheTier::Fast => ServedFrom::FastTier,
            CacheTier::Durable => ServedFrom::DurableTier,
        }
    }
}

/// Successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    #[serde(flatten)]
    pub result: AnalysisResult,
    pub correlation_id: CorrelationId,
    pub served_from: ServedFrom,
}

/// Counters of every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub admission: AdmissionStats,
    pub single_flight: SingleFlightStats,
    pub worker_pool: WorkerPoolStats,
    pub cache: TieredStats,
}

/// Outcome shared between a flight's owner and its followers.
#[derive(Debug, Clone)]
struct Shared {
    result: Arc<AnalysisResult>,
    served_from: ServedFrom,
}

/// A validated request.
struct Prepared {
    audio: Vec<u8>,
    format: AudioFormat,
    options: AnalysisOptions,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`RequestCoordinator`].
#[derive(Default)]
pub struct RequestCoordinatorBuilder {
    config: ChordgateConfig,
    decoder: Option<Arc<dyn AudioDecoder>>,
    engine: Option<Arc<dyn AnalysisEngine>>,
    durable: Option<Arc<dyn DurableTier>>,
    clock: Option<SharedClock>,
}

impl RequestCoordinatorBuilder {
    pub fn config(mut self, config: ChordgateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn AudioDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn AnalysisEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use this durable tier instead of opening `cache.durable_path`.
    pub fn durable_tier(mut self, durable: Arc<dyn DurableTier>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the coordinator.
    ///
    /// A durable tier that fails to open is logged and reported by
    /// [`RequestCoordinator::health`]; the coordinator runs fast-tier only.
    pub fn build(self) -> ChordgateResult<RequestCoordinator> {
        self.config.validate()?;

        let decoder = self.decoder.ok_or_else(|| ConfigError::MissingRequired {
            field: "decoder".to_string(),
        })?;
        let engine = self.engine.ok_or_else(|| ConfigError::MissingRequired {
            field: "engine".to_string(),
        })?;
        let clock = self.clock.unwrap_or_else(system_clock);
        let config = self.config;

        let mut durable_open_error = None;
        let durable = match (self.durable, &config.cache.durable_path) {
            (Some(durable), _) => Some(durable),
            (None, Some(path)) => match LmdbDurableTier::open(
                path,
                config.cache.durable_map_size_bytes,
                config.cache.durable_cap_bytes,
            ) {
                Ok(tier) => Some(Arc::new(tier) as Arc<dyn DurableTier>),
                Err(e) => {
                    tracing::warn!(
                        event = "durable_tier_unavailable",
                        path = %path.display(),
                        error = %e,
                        "durable tier failed to open, running fast tier only"
                    );
                    durable_open_error = Some(e.to_string());
                    None
                }
            },
            (None, None) => None,
        };

        let mut cache = TieredCache::new(&config.cache, clock);
        if let Some(durable) = durable {
            cache = cache.with_durable(durable);
        }

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(
            decoder,
            engine,
            config.admission.max_concurrent,
            shutdown.clone(),
        );

        tracing::info!(
            max_concurrent = config.admission.max_concurrent,
            max_queue_size = config.admission.max_queue_size,
            task_deadline_ms = config.worker.task_deadline.as_millis() as u64,
            ttl_secs = config.cache.ttl.as_secs(),
            durable = cache.has_durable(),
            "request coordinator ready"
        );

        Ok(RequestCoordinator {
            inner: Arc::new(Inner {
                admission: AdmissionController::new(&config.admission),
                flights: SingleFlight::new(config.follower_wait()),
                pool,
                cache,
                shutdown,
                started_at: Instant::now(),
                durable_open_error,
                config,
            }),
        })
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

struct Inner {
    config: ChordgateConfig,
    cache: TieredCache,
    flights: SingleFlight<Shared>,
    admission: AdmissionController,
    pool: WorkerPool,
    shutdown: CancellationToken,
    started_at: Instant,
    durable_open_error: Option<String>,
}

/// Entry point for analysis requests. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl RequestCoordinator {
    pub fn builder() -> RequestCoordinatorBuilder {
        RequestCoordinatorBuilder::default()
    }

    pub fn config(&self) -> &ChordgateConfig {
        &self.inner.config
    }

    /// Analyze a request, serving from cache when possible.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, RequestError> {
        let correlation_id = request.correlation_id.unwrap_or_default();
        let span = tracing::info_span!(
            "analyze",
            correlation_id = %correlation_id,
            cache_key = tracing::field::Empty,
        );
        self.run(request, correlation_id).instrument(span).await
    }

    /// API-layer entry point returning the serializable error body.
    pub async fn handle_request(
        &self,
        audio: AudioSource,
        format: &str,
        options: &Value,
        correlation_id: CorrelationId,
    ) -> Result<AnalysisResponse, ErrorResponse> {
        let request = AnalysisRequest {
            audio,
            format: format.to_string(),
            options: options.clone(),
            correlation_id: Some(correlation_id),
        };
        self.analyze(request).await.map_err(ErrorResponse::from)
    }

    async fn run(
        &self,
        request: AnalysisRequest,
        correlation_id: CorrelationId,
    ) -> Result<AnalysisResponse, RequestError> {
        let prepared = self
            .prepare(request)
            .map_err(|e| RequestError::new(correlation_id, e))?;
        let Prepared {
            audio,
            format,
            options,
        } = prepared;

        let key = derive(AudioContent::Bytes(&audio), format, &options);
        tracing::Span::current().record("cache_key", key.short().as_str());

        if let Some((result, served_from)) = self.lookup(&key).await {
            return Ok(self.respond(result, served_from, &options, correlation_id));
        }
        tracing::info!(event = "cache_miss", format = %format.as_str(), "cache miss");

        let audio = Arc::new(audio);
        let outcome = self
            .inner
            .flights
            .run_once(key, correlation_id, || {
                self.compute(key, correlation_id, audio, format, options.clone())
            })
            .await;

        match outcome.result {
            Ok(shared) => {
                let served_from = match outcome.role {
                    FlightRole::Owner => shared.served_from,
                    FlightRole::Follower => ServedFrom::SharedFlight,
                };
                let result = Arc::unwrap_or_clone(shared.result);
                Ok(self.respond(result, served_from, &options, correlation_id))
            }
            Err(error) => {
                Err(RequestError::new(correlation_id, error).with_origin(outcome.origin))
            }
        }
    }

    fn prepare(&self, request: AnalysisRequest) -> Result<Prepared, ChordgateError> {
        let max_bytes = self.inner.config.request.max_audio_bytes;

        let audio = match request.audio {
            AudioSource::Bytes(bytes) => bytes,
            AudioSource::Base64(text) => {
                // Reject oversized text before allocating the decoded copy.
                let estimated = (text.len() as u64 / 4).saturating_mul(3);
                if estimated > max_bytes.saturating_add(3) {
                    return Err(ValidationError::PayloadTooLarge {
                        size_bytes: estimated,
                        max_bytes,
                    }
                    .into());
                }
                BASE64_STANDARD.decode(text.trim()).map_err(|e| {
                    DecodeError::new(
                        DecodeFailure::InvalidEncoding,
                        format!("Invalid base64 audio data: {}", e),
                    )
                })?
            }
        };

        if audio.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "audio".to_string(),
            }
            .into());
        }
        if audio.len() as u64 > max_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size_bytes: audio.len() as u64,
                max_bytes,
            }
            .into());
        }

        let format = AudioFormat::parse(&request.format)?;

        let policy = self.inner.config.request.unknown_options;
        let options = AnalysisOptions::from_json(&request.options, policy)?;
        if policy == UnknownOptionPolicy::Ignore {
            let ignored = AnalysisOptions::unknown_fields(&request.options);
            if !ignored.is_empty() {
                tracing::debug!(?ignored, "ignoring unknown options");
            }
        }

        Ok(Prepared {
            audio,
            format,
            options,
        })
    }

    /// Cache lookup. A cached value that no longer decodes is dropped from
    /// both tiers and treated as a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<(AnalysisResult, ServedFrom)> {
        let started = std::time::Instant::now();
        let hit = self.inner.cache.get(key).await?;

        match decode_result(&hit.value) {
            Ok(mut result) => {
                let elapsed = started.elapsed();
                if let Some(info) = result.processing_info.as_mut() {
                    info.processing_time = elapsed.as_secs_f64();
                }
                tracing::info!(
                    event = "cache_hit",
                    tier = %hit.tier,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "cache hit"
                );
                Some((result, hit.tier.into()))
            }
            Err(e) => {
                tracing::warn!(tier = %hit.tier, error = %e, "discarding undecodable cached result");
                self.inner.cache.invalidate(key).await;
                None
            }
        }
    }

    /// Single-flight owner's computation.
    async fn compute(
        &self,
        key: CacheKey,
        correlation_id: CorrelationId,
        audio: Arc<Vec<u8>>,
        format: AudioFormat,
        options: AnalysisOptions,
    ) -> Result<Shared, ChordgateError> {
        // A previous owner may have finished between our lookup and
        // registration.
        if self.inner.cache.peek_fast(&key) {
            if let Some((result, served_from)) = self.lookup(&key).await {
                return Ok(Shared {
                    result: Arc::new(result),
                    served_from,
                });
            }
        }

        let ticket = match self
            .inner
            .admission
            .acquire(self.inner.config.admission.admission_timeout)
            .await
        {
            Ok(ticket) => ticket,
            Err(rejected) => {
                tracing::warn!(
                    event = "admission_rejected",
                    reason = %rejected.reason,
                    retry_after_secs = rejected.retry_after.as_secs(),
                    executing = self.inner.admission.executing(),
                    queued = self.inner.admission.queued(),
                    "admission rejected"
                );
                return Err(rejected.into());
            }
        };
        tracing::debug!(
            queued_ms = ticket.queued_for().as_millis() as u64,
            "admitted"
        );

        let task = AnalysisTask::new(
            correlation_id,
            audio,
            format,
            options,
            self.inner.config.worker.task_deadline,
        );
        let outcome = self.inner.pool.submit(task).await;
        ticket.release();

        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                match &error {
                    ChordgateError::TaskTimeout(timeout) => tracing::warn!(
                        event = "task_timeout",
                        stage = %timeout.stage,
                        limit_ms = timeout.limit.as_millis() as u64,
                        "analysis task timed out"
                    ),
                    other => tracing::warn!(error = %other, "analysis failed"),
                }
                return Err(error);
            }
        };

        match encode_result(&result) {
            Ok(bytes) => {
                self.inner
                    .cache
                    .put(key, bytes, self.inner.config.cache.ttl)
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize analysis result, not caching"),
        }

        tracing::info!(
            event = "analysis_complete",
            chords = result.chords.len(),
            processing_time = result
                .processing_info
                .as_ref()
                .map(|info| info.processing_time)
                .unwrap_or_default(),
            "analysis complete"
        );

        Ok(Shared {
            result: Arc::new(result),
            served_from: ServedFrom::Computed,
        })
    }

    fn respond(
        &self,
        mut result: AnalysisResult,
        served_from: ServedFrom,
        options: &AnalysisOptions,
        correlation_id: CorrelationId,
    ) -> AnalysisResponse {
        if !options.include_performance {
            result.processing_info = None;
        }
        AnalysisResponse {
            result,
            correlation_id,
            served_from,
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Stop accepting work. Queued requests are rejected, running tasks are
    /// cancelled and their waiters see a timeout. Cache hits are still served.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(
            executing = self.inner.admission.executing(),
            queued = self.inner.admission.queued(),
            "shutting down request coordinator"
        );
        self.inner.admission.close();
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Remove expired entries from both cache tiers now.
    pub async fn purge_expired(&self) -> PurgeReport {
        self.inner.cache.purge_expired().await
    }

    /// Sweep expired cache entries every `interval` until shutdown.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = inner.cache.purge_expired().await;
                        if report.fast > 0 || report.durable.unwrap_or(0) > 0 {
                            tracing::info!(
                                fast = report.fast,
                                durable = ?report.durable,
                                "purged expired cache entries"
                            );
                        }
                    }
                }
            }
            tracing::debug!("cache maintenance stopped");
        })
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    pub async fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            admission: self.inner.admission.stats(),
            single_flight: self.inner.flights.stats(),
            worker_pool: self.inner.pool.stats(),
            cache: self.inner.cache.stats().await,
        }
    }

    /// Readiness report. A degraded coordinator still serves requests.
    pub async fn health(&self) -> HealthReport {
        let checks = vec![
            self.admission_check(),
            self.worker_pool_check(),
            self.durable_check(),
            self.cache_check().await,
        ];
        HealthReport::new(
            env!("CARGO_PKG_VERSION"),
            self.inner.started_at.elapsed().as_secs(),
            checks,
        )
    }

    fn admission_check(&self) -> HealthCheck {
        let admission = &self.inner.admission;
        let check = if admission.is_closed() {
            HealthCheck::unhealthy("admission", "shutting down")
        } else if admission.queue_capacity() > 0 && admission.queued() >= admission.queue_capacity() {
            HealthCheck::degraded("admission", "wait queue is full")
        } else {
            HealthCheck::healthy("admission")
        };
        check
            .with_metadata("executing", json!(admission.executing()))
            .with_metadata("queued", json!(admission.queued()))
            .with_metadata("max_concurrent", json!(admission.limit()))
            .with_metadata("max_queue_size", json!(admission.queue_capacity()))
    }

    fn worker_pool_check(&self) -> HealthCheck {
        let stats = self.inner.pool.stats();
        let check = if self.inner.shutdown.is_cancelled() {
            HealthCheck::unhealthy("worker_pool", "shutting down")
        } else {
            HealthCheck::healthy("worker_pool")
        };
        check
            .with_metadata("workers", json!(stats.worker_count))
            .with_metadata("running", json!(stats.running))
            .with_metadata("panicked", json!(stats.panicked))
    }

    fn durable_check(&self) -> HealthCheck {
        match self.inner.cache.durable_status() {
            DurableStatus::Disabled => match &self.inner.durable_open_error {
                Some(error) => HealthCheck::degraded("durable_tier", error.clone()),
                None => HealthCheck::healthy("durable_tier").with_metadata("enabled", json!(false)),
            },
            DurableStatus::Available => {
                HealthCheck::healthy("durable_tier").with_metadata("enabled", json!(true))
            }
            DurableStatus::BackingOff { remaining } => {
                HealthCheck::degraded("durable_tier", "unavailable, serving fast tier only")
                    .with_metadata("retry_in_ms", json!(remaining.as_millis() as u64))
            }
        }
    }

    async fn cache_check(&self) -> HealthCheck {
        let stats = self.inner.cache.stats().await;
        HealthCheck::healthy("cache")
            .with_metadata("entries", json!(stats.fast.entry_count))
            .with_metadata("bytes", json!(stats.fast.memory_bytes))
            .with_metadata("hit_rate", json!(stats.hit_rate()))
    }
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("max_concurrent", &self.inner.admission.limit())
            .field("executing", &self.inner.admission.executing())
            .field("in_flight", &self.inner.flights.in_flight())
            .field("durable", &self.inner.cache.has_durable())
            .finish()
    }
}

/// Cached value layout. Floats must survive the round trip bit for bit so a
/// cache hit matches the computed result exactly.
fn encode_result(result: &AnalysisResult) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(result)
}

fn decode_result(bytes: &[u8]) -> serde_json::Result<AnalysisResult> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chordgate_core::{
        ChordEntry, DecodedAudio, ErrorCode, HealthStatus, ProcessingInfo, SCHEMA_VERSION,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkDecoder;

    impl AudioDecoder for OkDecoder {
        fn decode(&self, _bytes: &[u8], _format: AudioFormat) -> Result<DecodedAudio, DecodeError> {
            Ok(DecodedAudio::new(vec![0.0; 44_100], 44_100, 1))
        }
    }

    #[derive(Default)]
    struct CountingEngine(AtomicUsize);

    impl AnalysisEngine for CountingEngine {
        fn analyze(
            &self,
            audio: &DecodedAudio,
            options: &AnalysisOptions,
            _cancel: &CancellationToken,
        ) -> Result<AnalysisResult, chordgate_core::AnalysisError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AnalysisResult {
                schema_version: SCHEMA_VERSION.to_string(),
                key: Some("C major".to_string()),
                tempo: Some(120.0),
                chords: vec![ChordEntry::new(0.0, options.model.as_str(), Some(0.9))],
                duration: audio.duration_secs(),
                processing_info: None,
            })
        }
    }

    fn coordinator(engine: Arc<CountingEngine>) -> RequestCoordinator {
        RequestCoordinator::builder()
            .decoder(Arc::new(OkDecoder))
            .engine(engine)
            .build()
            .unwrap()
    }

    #[test]
    fn test_cached_result_floats_round_trip_exactly() {
        // 4096 samples at 44.1 kHz has no short decimal form.
        let duration = 4_096.0 / 44_100.0;
        let result = AnalysisResult {
            schema_version: SCHEMA_VERSION.to_string(),
            key: Some("A minor".to_string()),
            tempo: Some(60.0 / 0.4643990929705215),
            chords: vec![ChordEntry::new(duration / 3.0, "Am", Some(0.7f32 / 3.0))],
            duration,
            processing_info: Some(ProcessingInfo {
                sample_rate: 44_100,
                channels: 2,
                processing_time: 0.1 + 0.2,
                model_used: "basic".to_string(),
            }),
        };

        let decoded = decode_result(&encode_result(&result).unwrap()).unwrap();
        assert_eq!(decoded.duration.to_bits(), result.duration.to_bits());
        assert_eq!(
            decoded.tempo.map(f64::to_bits),
            result.tempo.map(f64::to_bits)
        );
        assert_eq!(decoded.chords[0].time.to_bits(), result.chords[0].time.to_bits());
        assert_eq!(
            decoded.processing_info.as_ref().map(|i| i.processing_time.to_bits()),
            Some((0.1f64 + 0.2).to_bits())
        );
        assert!(decoded.same_content(&result));
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_config_error() {
        let err = RequestCoordinator::builder()
            .decoder(Arc::new(OkDecoder))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ChordgateError::Config(ConfigError::MissingRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let err = RequestCoordinator::builder()
            .config(ChordgateConfig::default().with_admission(0, 10))
            .decoder(Arc::new(OkDecoder))
            .engine(Arc::new(CountingEngine::default()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ChordgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let coordinator = coordinator(Arc::new(CountingEngine::default()));

        let empty = coordinator
            .analyze(AnalysisRequest::new(Vec::<u8>::new(), "wav"))
            .await
            .unwrap_err();
        assert_eq!(empty.code(), ErrorCode::MissingField);

        let format = coordinator
            .analyze(AnalysisRequest::new(b"RIFF".to_vec(), "aiff"))
            .await
            .unwrap_err();
        assert_eq!(format.code(), ErrorCode::UnsupportedFormat);

        let bad_b64 = coordinator
            .analyze(AnalysisRequest::new(
                AudioSource::Base64("not base64!!".to_string()),
                "wav",
            ))
            .await
            .unwrap_err();
        assert_eq!(bad_b64.code(), ErrorCode::DecodingError);

        let unknown = coordinator
            .analyze(
                AnalysisRequest::new(b"RIFF".to_vec(), "wav").with_options(json!({"beam": 3})),
            )
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), ErrorCode::InvalidOption);
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let mut config = ChordgateConfig::default();
        config.request.max_audio_bytes = 8;
        let coordinator = RequestCoordinator::builder()
            .config(config)
            .decoder(Arc::new(OkDecoder))
            .engine(Arc::new(CountingEngine::default()))
            .build()
            .unwrap();

        let err = coordinator
            .analyze(AnalysisRequest::new(vec![1u8; 9], "wav"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileTooLarge);
        assert!(coordinator
            .analyze(AnalysisRequest::new(vec![1u8; 8], "wav"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_base64_and_raw_bytes_share_a_key() {
        let engine = Arc::new(CountingEngine::default());
        let coordinator = coordinator(engine.clone());
        let audio = b"RIFF....WAVEfmt ".to_vec();

        let raw = coordinator
            .analyze(AnalysisRequest::new(audio.clone(), "wav"))
            .await
            .unwrap();
        assert_eq!(raw.served_from, ServedFrom::Computed);

        let encoded = coordinator
            .analyze(AnalysisRequest::new(
                AudioSource::Base64(BASE64_STANDARD.encode(&audio)),
                "WAV",
            ))
            .await
            .unwrap();
        assert_eq!(encoded.served_from, ServedFrom::FastTier);
        assert_eq!(engine.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_include_performance_strips_processing_info() {
        let engine = Arc::new(CountingEngine::default());
        let coordinator = coordinator(engine.clone());

        let with_info = coordinator
            .analyze(AnalysisRequest::new(b"RIFF".to_vec(), "wav"))
            .await
            .unwrap();
        assert!(with_info.result.processing_info.is_some());

        let without = coordinator
            .analyze(
                AnalysisRequest::new(b"RIFF".to_vec(), "wav")
                    .with_options(json!({"include_performance": false})),
            )
            .await
            .unwrap();
        assert!(without.result.processing_info.is_none());
        // Presentation-only option: same key, served from cache.
        assert_eq!(without.served_from, ServedFrom::FastTier);
        assert_eq!(engine.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_correlation_id_is_echoed() {
        let coordinator = coordinator(Arc::new(CountingEngine::default()));
        let id = CorrelationId::new();
        let ok = coordinator
            .handle_request(
                AudioSource::Bytes(b"RIFF".to_vec()),
                "wav",
                &Value::Null,
                id,
            )
            .await
            .unwrap();
        assert_eq!(ok.correlation_id, id);

        let err = coordinator
            .handle_request(AudioSource::Bytes(Vec::new()), "wav", &Value::Null, id)
            .await
            .unwrap_err();
        assert_eq!(err.correlation_id, id);
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn test_response_serializes_flat() {
        let coordinator = coordinator(Arc::new(CountingEngine::default()));
        let response = coordinator
            .analyze(AnalysisRequest::new(b"RIFF".to_vec(), "wav"))
            .await
            .unwrap();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["key"], "C major");
        assert_eq!(value["served_from"], "computed");
        assert!(value["chords"].is_array());
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let coordinator = coordinator(Arc::new(CountingEngine::default()));
        let report = coordinator.health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.is_ready());
        for component in ["admission", "worker_pool", "durable_tier", "cache"] {
            assert!(report.check(component).is_some(), "missing {component}");
        }

        coordinator.shutdown();
        let report = coordinator.health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_ready());
    }

    #[tokio::test]
    async fn test_unopenable_durable_path_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let coordinator = RequestCoordinator::builder()
            .config(ChordgateConfig::default().with_durable_path(blocker.join("lmdb")))
            .decoder(Arc::new(OkDecoder))
            .engine(Arc::new(CountingEngine::default()))
            .build()
            .unwrap();

        let report = coordinator.health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());
        assert!(coordinator
            .analyze(AnalysisRequest::new(b"RIFF".to_vec(), "wav"))
            .await
            .is_ok());
    }
}

//! Shared harness for coordinator integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chordgate_core::{
    derive, AnalysisOptions, AudioContent, AudioFormat, CacheKey, ChordgateConfig, ManualClock,
    UnknownOptionPolicy,
};
use chordgate_runtime::{AnalysisRequest, RequestCoordinator};
use chordgate_storage::DurableTier;
use chordgate_test_utils::{MockDecoder, MockEngine};
use serde_json::Value;

pub struct Harness {
    pub coordinator: RequestCoordinator,
    pub engine: Arc<MockEngine>,
    pub decoder: Arc<MockDecoder>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: ChordgateConfig) -> Harness {
    build(config, Arc::new(MockEngine::new()), None)
}

pub fn harness_with_engine(config: ChordgateConfig, engine: Arc<MockEngine>) -> Harness {
    build(config, engine, None)
}

pub fn harness_with_durable(config: ChordgateConfig, durable: Arc<dyn DurableTier>) -> Harness {
    build(config, Arc::new(MockEngine::new()), Some(durable))
}

fn build(
    config: ChordgateConfig,
    engine: Arc<MockEngine>,
    durable: Option<Arc<dyn DurableTier>>,
) -> Harness {
    let decoder = Arc::new(MockDecoder::new());
    let clock = Arc::new(ManualClock::starting_now());

    let mut builder = RequestCoordinator::builder()
        .config(config)
        .decoder(decoder.clone())
        .engine(engine.clone())
        .clock(clock.clone());
    if let Some(durable) = durable {
        builder = builder.durable_tier(durable);
    }

    Harness {
        coordinator: builder.build().expect("coordinator should build"),
        engine,
        decoder,
        clock,
    }
}

pub fn request(audio: &[u8], options: Value) -> AnalysisRequest {
    AnalysisRequest::new(audio.to_vec(), "wav").with_options(options)
}

/// Cache key the coordinator derives for a wav request.
pub fn key_for(audio: &[u8], options: &Value) -> CacheKey {
    let options = AnalysisOptions::from_json(options, UnknownOptionPolicy::Reject)
        .expect("valid options");
    derive(AudioContent::Bytes(audio), AudioFormat::Wav, &options)
}

/// Poll `condition` until it holds, failing the test after ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

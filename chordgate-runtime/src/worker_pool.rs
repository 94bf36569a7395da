//! Worker pool for decoder and engine calls.
//!
//! Each task runs on a dedicated blocking thread holding one of the pool's
//! worker slots. A panic inside the decoder or the engine is caught on that
//! thread and becomes an [`AnalysisError::EnginePanic`]; other workers are
//! unaffected. When a task overruns its deadline (or the pool shuts down),
//! its cancellation token fires and the caller is released at once with a
//! [`TaskTimeout`]. Threads cannot be killed safely, so the worker slot
//! returns to the pool when the cooperatively cancelled thread finishes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chordgate_core::{
    AnalysisEngine, AnalysisError, AnalysisOptions, AnalysisResult, AudioDecoder, AudioFormat,
    ChordgateError, CorrelationId, ProcessingInfo, TaskTimeout, TimeoutStage,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One unit of analysis work.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    pub correlation_id: CorrelationId,
    /// Encoded audio. Decoding happens on the worker thread.
    pub audio: Arc<Vec<u8>>,
    pub format: AudioFormat,
    pub options: AnalysisOptions,
    pub deadline: Instant,
}

impl AnalysisTask {
    pub fn new(
        correlation_id: CorrelationId,
        audio: Arc<Vec<u8>>,
        format: AudioFormat,
        options: AnalysisOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            correlation_id,
            audio,
            format,
            options,
            deadline: Instant::now() + timeout,
        }
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    /// Threads currently running a task, cancelled ones included.
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct Counters {
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
}

/// Tracks a running worker thread.
struct RunningGuard(Arc<Counters>);

impl RunningGuard {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.running.fetch_add(1, Ordering::AcqRel);
        Self(counters.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed-size pool of blocking workers.
pub struct WorkerPool {
    decoder: Arc<dyn AudioDecoder>,
    engine: Arc<dyn AnalysisEngine>,
    slots: Arc<Semaphore>,
    worker_count: usize,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(
        decoder: Arc<dyn AudioDecoder>,
        engine: Arc<dyn AnalysisEngine>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            decoder,
            engine,
            slots: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            shutdown,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Run a task to completion, or until its deadline or shutdown.
    pub async fn submit(&self, task: AnalysisTask) -> Result<AnalysisResult, ChordgateError> {
        let limit = task.deadline.saturating_duration_since(Instant::now());
        let deadline = task.deadline;
        let correlation_id = task.correlation_id;

        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                return Err(self.timeout(TimeoutStage::Shutdown, limit));
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(self.timeout(TimeoutStage::Deadline, limit));
            }
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(self.timeout(TimeoutStage::Shutdown, limit)),
            },
        };

        let cancel = self.shutdown.child_token();
        let worker_cancel = cancel.clone();
        let decoder = self.decoder.clone();
        let engine = self.engine.clone();
        let counters = self.counters.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _running = RunningGuard::enter(&counters);
            run_isolated(decoder.as_ref(), engine.as_ref(), &task, &worker_cancel)
        });

        // Cancels the worker if this future is dropped before it finishes.
        let cancel_on_drop = cancel.clone().drop_guard();

        let outcome = tokio::select! {
            joined = handle => {
                match joined {
                    // The engine noticed cancellation before this select did.
                    Ok(Err(ChordgateError::Analysis(AnalysisError::Cancelled))) => {
                        let stage = if self.shutdown.is_cancelled() {
                            TimeoutStage::Shutdown
                        } else {
                            TimeoutStage::Deadline
                        };
                        Err(self.timeout(stage, limit))
                    }
                    Ok(result) => result,
                    Err(join_error) => Err(AnalysisError::EnginePanic {
                        reason: join_error.to_string(),
                    }
                    .into()),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                cancel.cancel();
                tracing::debug!(
                    correlation_id = %correlation_id,
                    limit_ms = limit.as_millis() as u64,
                    "deadline reached, cancelling worker"
                );
                Err(self.timeout(TimeoutStage::Deadline, limit))
            }
            _ = self.shutdown.cancelled() => {
                Err(self.timeout(TimeoutStage::Shutdown, limit))
            }
        };
        drop(cancel_on_drop.disarm());

        match &outcome {
            Ok(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(ChordgateError::Analysis(AnalysisError::EnginePanic { reason })) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(correlation_id = %correlation_id, %reason, "analysis worker panicked");
            }
            Err(ChordgateError::TaskTimeout(_)) => {}
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            worker_count: self.worker_count,
            running: self.counters.running.load(Ordering::Acquire),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    fn timeout(&self, stage: TimeoutStage, limit: Duration) -> ChordgateError {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        TaskTimeout { stage, limit }.into()
    }
}

/// Decode then analyze on the current thread, converting panics to errors.
fn run_isolated(
    decoder: &dyn AudioDecoder,
    engine: &dyn AnalysisEngine,
    task: &AnalysisTask,
    cancel: &CancellationToken,
) -> Result<AnalysisResult, ChordgateError> {
    let started = std::time::Instant::now();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        if cancel.is_cancelled() {
            return Err(ChordgateError::from(AnalysisError::Cancelled));
        }
        let decoded = decoder.decode(&task.audio, task.format)?;

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled.into());
        }
        let result = engine.analyze(&decoded, &task.options, cancel)?;
        Ok((result, decoded.sample_rate, decoded.channels))
    }));

    let (result, sample_rate, channels) = match outcome {
        Ok(inner) => inner?,
        Err(payload) => {
            return Err(AnalysisError::EnginePanic {
                reason: panic_message(payload.as_ref()),
            }
            .into())
        }
    };

    let processing_time = started.elapsed().as_secs_f64();
    let mut result = result.with_sorted_chords();
    match result.processing_info.as_mut() {
        Some(info) => info.processing_time = processing_time,
        None => {
            result.processing_info = Some(ProcessingInfo {
                sample_rate,
                channels,
                processing_time,
                model_used: task.options.model.as_str().to_string(),
            })
        }
    }
    Ok(result)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

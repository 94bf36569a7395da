//! CHORDGATE Runtime - Request Coordination
//!
//! Turns analysis requests into at most one engine invocation per distinct
//! input under bounded load:
//!
//! - [`SingleFlight`]: one computation per cache key, outcome shared
//! - [`AdmissionController`]: concurrency limit with a bounded wait queue
//! - [`WorkerPool`]: isolated, deadline-bounded execution of decode + analyze
//! - [`RequestCoordinator`]: the cache-check, dedupe, admit, execute, store loop
//!
//! # Example
//!
//! ```ignore
//! let coordinator = RequestCoordinator::builder()
//!     .config(ChordgateConfig::from_env())
//!     .decoder(Arc::new(MyDecoder))
//!     .engine(Arc::new(MyEngine))
//!     .build()?;
//! let _sweeper = coordinator.spawn_maintenance(Duration::from_secs(3600));
//!
//! let response = coordinator
//!     .analyze(AnalysisRequest::new(bytes, "wav").with_options(json!({"model": "advanced"})))
//!     .await?;
//! ```

pub mod admission;
pub mod coordinator;
pub mod single_flight;
pub mod telemetry;
pub mod worker_pool;

pub use admission::{AdmissionController, AdmissionStats, AdmissionTicket};
pub use coordinator::{
    AnalysisRequest, AnalysisResponse, AudioSource, CoordinatorStats, RequestCoordinator,
    RequestCoordinatorBuilder, ServedFrom,
};
pub use single_flight::{FlightOutcome, FlightRole, SingleFlight, SingleFlightStats};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
pub use worker_pool::{AnalysisTask, WorkerPool, WorkerPoolStats};

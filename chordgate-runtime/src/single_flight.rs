//! Single-flight deduplication.
//!
//! The first caller for a key becomes the owner and runs the computation;
//! callers arriving while it is outstanding attach as followers and receive
//! the owner's outcome verbatim, success or failure. Followers never run the
//! computation themselves.
//!
//! Registration is an atomic check-and-set on a sharded map entry, so two
//! callers can never both become owner of the same key. Waiting is bounded:
//! a follower gives up after `follower_wait`, and learns immediately if the
//! owner goes away without publishing an outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chordgate_core::{CacheKey, ChordgateError, CorrelationId, TaskTimeout, TimeoutStage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

type Outcome<T> = Option<Result<T, ChordgateError>>;

/// An outstanding computation.
struct InFlight<T> {
    id: u64,
    origin: CorrelationId,
    rx: watch::Receiver<Outcome<T>>,
}

/// How a caller took part in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Owner,
    Follower,
}

/// Outcome delivered to one caller.
#[derive(Debug, Clone)]
pub struct FlightOutcome<T> {
    pub result: Result<T, ChordgateError>,
    pub role: FlightRole,
    /// Correlation id of the owner that ran the computation.
    pub origin: CorrelationId,
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleFlightStats {
    pub owners: u64,
    pub followers: u64,
    pub follower_timeouts: u64,
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    owners: AtomicU64,
    followers: AtomicU64,
    follower_timeouts: AtomicU64,
    abandoned: AtomicU64,
}

/// Registry of in-flight computations keyed by [`CacheKey`].
pub struct SingleFlight<T> {
    flights: DashMap<CacheKey, Arc<InFlight<T>>>,
    next_id: AtomicU64,
    follower_wait: Duration,
    counters: Counters,
}

/// Removes the owner's registry entry on every exit path, including the
/// owner's future being dropped mid-computation.
struct FlightGuard<'a, T> {
    flights: &'a DashMap<CacheKey, Arc<InFlight<T>>>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

enum Registration<T> {
    Owner {
        tx: watch::Sender<Outcome<T>>,
        id: u64,
    },
    Follower(Arc<InFlight<T>>),
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync,
{
    pub fn new(follower_wait: Duration) -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(1),
            follower_wait,
            counters: Counters::default(),
        }
    }

    /// Run `compute` unless a computation for `key` is already outstanding,
    /// in which case wait for and share its outcome.
    pub async fn run_once<F, Fut>(
        &self,
        key: CacheKey,
        caller: CorrelationId,
        compute: F,
    ) -> FlightOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ChordgateError>>,
    {
        let registration = match self.flights.entry(key) {
            Entry::Occupied(existing) => Registration::Follower(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(Arc::new(InFlight {
                    id,
                    origin: caller,
                    rx,
                }));
                Registration::Owner { tx, id }
            }
        };

        match registration {
            Registration::Owner { tx, id } => {
                self.counters.owners.fetch_add(1, Ordering::Relaxed);
                let guard = FlightGuard {
                    flights: &self.flights,
                    key,
                    id,
                };

                let result = compute().await;
                // Publish before deregistering: a caller that still finds the
                // entry sees the outcome immediately.
                tx.send_replace(Some(result.clone()));
                drop(guard);

                FlightOutcome {
                    result,
                    role: FlightRole::Owner,
                    origin: caller,
                }
            }
            Registration::Follower(flight) => {
                self.counters.followers.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    cache_key = %key.short(),
                    correlation_id = %caller,
                    origin_correlation_id = %flight.origin,
                    "joining in-flight computation"
                );
                let result = self.follow(&flight).await;
                FlightOutcome {
                    result,
                    role: FlightRole::Follower,
                    origin: flight.origin,
                }
            }
        }
    }

    async fn follow(&self, flight: &InFlight<T>) -> Result<T, ChordgateError> {
        let mut rx = flight.rx.clone();
        let waited = tokio::time::timeout(self.follower_wait, async {
            rx.wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) | Ok(Err(_)) => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                Err(TaskTimeout {
                    stage: TimeoutStage::OwnerAbandoned,
                    limit: self.follower_wait,
                }
                .into())
            }
            Err(_) => {
                self.counters.follower_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(TaskTimeout {
                    stage: TimeoutStage::FollowerWait,
                    limit: self.follower_wait,
                }
                .into())
            }
        }
    }

    /// Number of keys with an outstanding computation.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.flights.contains_key(key)
    }

    pub fn stats(&self) -> SingleFlightStats {
        SingleFlightStats {
            owners: self.counters.owners.load(Ordering::Relaxed),
            followers: self.counters.followers.load(Ordering::Relaxed),
            follower_timeouts: self.counters.follower_timeouts.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }
}

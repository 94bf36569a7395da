//! Admission control: a concurrency limit C with a bounded wait queue Q.
//!
//! - fewer than C tickets outstanding: grant immediately
//! - otherwise, fewer than Q waiters: queue, bounded by the caller's timeout
//! - otherwise: reject immediately
//!
//! A ticket wraps an owned semaphore permit, so it is released exactly once,
//! when dropped, on every exit path of the task holding it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chordgate_core::{AdmissionConfig, AdmissionRejected, RejectReason};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

/// A granted execution slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
    granted_at: Instant,
    queued_for: Duration,
}

impl AdmissionTicket {
    /// Time spent queued before the grant.
    pub fn queued_for(&self) -> Duration {
        self.queued_for
    }

    pub fn held_for(&self) -> Duration {
        self.granted_at.elapsed()
    }

    /// Release the slot. Equivalent to dropping the ticket.
    pub fn release(self) {}
}

/// Snapshot of admission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub granted: u64,
    pub rejected_queue_full: u64,
    pub rejected_wait_timeout: u64,
    pub rejected_shutting_down: u64,
    pub executing: usize,
    pub queued: usize,
    pub peak_executing: usize,
    pub peak_queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicU64,
    rejected_queue_full: AtomicU64,
    rejected_wait_timeout: AtomicU64,
    rejected_shutting_down: AtomicU64,
    peak_executing: AtomicUsize,
    peak_queued: AtomicUsize,
}

/// Decrements the waiter count when a queued acquire finishes or is dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded-concurrency gate with a bounded wait queue.
#[derive(Debug)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    limit: usize,
    queue_capacity: usize,
    waiting: AtomicUsize,
    busy_retry_after: Duration,
    timeout_retry_after: Duration,
    counters: Counters,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        let limit = config.max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            queue_capacity: config.max_queue_size,
            waiting: AtomicUsize::new(0),
            busy_retry_after: config.busy_retry_after,
            timeout_retry_after: config.timeout_retry_after,
            counters: Counters::default(),
        }
    }

    /// Acquire a ticket, waiting at most `timeout` in the queue.
    pub async fn acquire(&self, timeout: Duration) -> Result<AdmissionTicket, AdmissionRejected> {
        let started = Instant::now();

        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => return Ok(self.grant(permit, started)),
            Err(TryAcquireError::Closed) => return Err(self.reject(RejectReason::ShuttingDown)),
            Err(TryAcquireError::NoPermits) => {}
        }

        let reserved = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (w < self.queue_capacity).then_some(w + 1)
            });
        let queued = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => return Err(self.reject(RejectReason::QueueFull)),
        };
        self.counters.peak_queued.fetch_max(queued, Ordering::Relaxed);
        let _slot = QueueSlot(&self.waiting);

        match tokio::time::timeout(timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.grant(permit, started)),
            Ok(Err(_)) => Err(self.reject(RejectReason::ShuttingDown)),
            Err(_) => Err(self.reject(RejectReason::WaitTimeout)),
        }
    }

    /// Stop granting. Queued waiters are rejected; outstanding tickets stay
    /// valid until dropped.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Tickets currently outstanding.
    pub fn executing(&self) -> usize {
        self.limit.saturating_sub(self.slots.available_permits())
    }

    /// Requests currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            granted: self.counters.granted.load(Ordering::Relaxed),
            rejected_queue_full: self.counters.rejected_queue_full.load(Ordering::Relaxed),
            rejected_wait_timeout: self.counters.rejected_wait_timeout.load(Ordering::Relaxed),
            rejected_shutting_down: self.counters.rejected_shutting_down.load(Ordering::Relaxed),
            executing: self.executing(),
            queued: self.queued(),
            peak_executing: self.counters.peak_executing.load(Ordering::Relaxed),
            peak_queued: self.counters.peak_queued.load(Ordering::Relaxed),
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit, started: Instant) -> AdmissionTicket {
        self.counters.granted.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak_executing
            .fetch_max(self.executing(), Ordering::Relaxed);
        AdmissionTicket {
            _permit: permit,
            granted_at: Instant::now(),
            queued_for: started.elapsed(),
        }
    }

    fn reject(&self, reason: RejectReason) -> AdmissionRejected {
        let (counter, retry_after) = match reason {
            RejectReason::QueueFull => (&self.counters.rejected_queue_full, self.busy_retry_after),
            RejectReason::WaitTimeout => {
                (&self.counters.rejected_wait_timeout, self.timeout_retry_after)
            }
            RejectReason::ShuttingDown => {
                (&self.counters.rejected_shutting_down, self.busy_retry_after)
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        AdmissionRejected {
            reason,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(limit: usize, queue: usize) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(&AdmissionConfig {
            max_concurrent: limit,
            max_queue_size: queue,
            ..AdmissionConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_grants_up_to_limit() {
        let gate = controller(2, 0);
        let a = gate.acquire(Duration::from_secs(1)).await.unwrap();
        let _b = gate.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(gate.executing(), 2);

        let rejected = gate.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(rejected.reason, RejectReason::QueueFull);
        assert_eq!(rejected.retry_after, Duration::from_secs(60));

        a.release();
        assert_eq!(gate.executing(), 1);
        assert!(gate.acquire(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_times_out() {
        let gate = controller(1, 1);
        let _held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let rejected = gate.acquire(Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(rejected.reason, RejectReason::WaitTimeout);
        assert_eq!(rejected.retry_after, Duration::from_secs(30));
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn test_queued_request_granted_on_release() {
        let gate = controller(1, 1);
        let held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(Duration::from_secs(10)).await })
        };
        while gate.queued() == 0 {
            tokio::task::yield_now().await;
        }
        drop(held);

        let ticket = waiter.await.unwrap().unwrap();
        assert_eq!(gate.executing(), 1);
        drop(ticket);
        assert_eq!(gate.executing(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let gate = controller(1, 1);
        let _held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let _queued = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(Duration::from_secs(60)).await })
        };
        while gate.queued() == 0 {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        let rejected = gate.acquire(Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(rejected.reason, RejectReason::QueueFull);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(gate.stats().rejected_queue_full, 1);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters_and_new_requests() {
        let gate = controller(1, 4);
        let held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(Duration::from_secs(60)).await })
        };
        while gate.queued() == 0 {
            tokio::task::yield_now().await;
        }

        gate.close();
        let rejected = waiter.await.unwrap().unwrap_err();
        assert_eq!(rejected.reason, RejectReason::ShuttingDown);
        assert_eq!(
            gate.acquire(Duration::from_secs(1)).await.unwrap_err().reason,
            RejectReason::ShuttingDown
        );
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_more_than_limit_executing() {
        let gate = controller(3, 100);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..30 {
            let gate = gate.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let ticket = gate.acquire(Duration::from_secs(30)).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                drop(ticket);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(gate.stats().peak_executing <= 3);
        assert_eq!(gate.executing(), 0);
        assert_eq!(gate.stats().granted, 30);
    }
}

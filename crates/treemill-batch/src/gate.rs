//! Admission gate bounding how many jobs execute at once.
//!
//! # Design
//! - A `tokio::sync::Semaphore` holds the slots; counters make the bound observable.
//! - Release is tied to `AdmissionPermit::drop`, so every exit path (success,
//!   error, panic unwind, task abort) releases exactly once.
//! - Counters are decremented before the semaphore slot is returned, so
//!   `outstanding` never reads above `capacity`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cancel::CancellationController;
use crate::error::{BatchError, BatchResult};

/// Shared handle onto the run's admission slots.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

/// Point-in-time view of the gate counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct GateSnapshot {
    /// Configured number of slots.
    pub capacity: usize,
    /// Slots currently held.
    pub outstanding: usize,
    /// Highest number of slots ever held at once.
    pub high_water: usize,
    /// Successful acquisitions over the gate's lifetime.
    pub acquired_total: u64,
    /// Releases over the gate's lifetime.
    pub released_total: u64,
}

impl AdmissionGate {
    /// Create a gate with `capacity` slots, clamped to `1..=Semaphore::MAX_PERMITS`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                outstanding: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                released_total: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a free slot, failing fast once the run is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Cancelled`] if cancellation is or becomes triggered
    /// before a slot is granted, and [`BatchError::AdmissionClosed`] if the gate
    /// was closed.
    pub async fn acquire(&self, cancel: &CancellationController) -> BatchResult<AdmissionPermit> {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let started = Instant::now();
        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BatchError::Cancelled),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| BatchError::AdmissionClosed)?
            }
        };
        Ok(self.admit(permit, started.elapsed()))
    }

    /// Close the gate; pending and future acquisitions fail with `AdmissionClosed`.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    /// Configured number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently held.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Capture all counters.
    #[must_use]
    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            capacity: self.inner.capacity,
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            high_water: self.inner.high_water.load(Ordering::SeqCst),
            acquired_total: self.inner.acquired_total.load(Ordering::SeqCst),
            released_total: self.inner.released_total.load(Ordering::SeqCst),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit, waited: Duration) -> AdmissionPermit {
        let outstanding = self.inner.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.high_water.fetch_max(outstanding, Ordering::SeqCst);
        self.inner.acquired_total.fetch_add(1, Ordering::SeqCst);
        AdmissionPermit {
            gate: Arc::clone(&self.inner),
            waited,
            _slot: permit,
        }
    }
}

/// One granted slot; dropping it is the release.
#[derive(Debug)]
#[must_use = "dropping the permit releases the admission slot immediately"]
pub struct AdmissionPermit {
    gate: Arc<GateInner>,
    waited: Duration,
    // Dropped after `Drop::drop` runs, returning the slot last.
    _slot: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Time spent waiting for this slot.
    #[must_use]
    pub const fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.gate.released_total.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn acquire_and_drop_are_paired() -> TestResult<()> {
        let gate = AdmissionGate::new(2);
        let cancel = CancellationController::new();

        let first = gate.acquire(&cancel).await?;
        let second = gate.acquire(&cancel).await?;
        assert_eq!(gate.outstanding(), 2);
        drop(first);
        assert_eq!(gate.outstanding(), 1);
        drop(second);

        let snapshot = gate.snapshot();
        assert_eq!(snapshot.outstanding, 0);
        assert_eq!(snapshot.acquired_total, 2);
        assert_eq!(snapshot.released_total, 2);
        assert_eq!(snapshot.high_water, 2);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity_until_release() -> TestResult<()> {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationController::new();
        let held = gate.acquire(&cancel).await?;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), gate.acquire(&cancel)).await;
        assert!(blocked.is_err(), "second acquire should wait while the slot is held");

        drop(held);
        let granted = tokio::time::timeout(Duration::from_secs(5), gate.acquire(&cancel)).await?;
        assert!(granted.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_fails_fast_before_waiting() {
        let gate = AdmissionGate::new(4);
        let cancel = CancellationController::new();
        cancel.cancel("test");
        let result = gate.acquire(&cancel).await;
        assert!(matches!(result, Err(BatchError::Cancelled)));
        assert_eq!(gate.snapshot().acquired_total, 0);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiting_acquire() -> TestResult<()> {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationController::new();
        let _held = gate.acquire(&cancel).await?;

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel("test");

        let result = tokio::time::timeout(Duration::from_secs(5), waiter).await??;
        assert!(matches!(result, Err(BatchError::Cancelled)));
        assert_eq!(gate.outstanding(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn closed_gate_reports_admission_failure() {
        let gate = AdmissionGate::new(1);
        gate.close();
        let result = gate.acquire(&CancellationController::new()).await;
        assert!(matches!(result, Err(BatchError::AdmissionClosed)));
    }

    #[tokio::test]
    async fn permit_released_when_holder_panics() -> TestResult<()> {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationController::new();
        let permit = gate.acquire(&cancel).await?;
        let joined = tokio::spawn(async move {
            let _permit = permit;
            panic!("job blew up");
        })
        .await;
        assert!(joined.is_err());

        let snapshot = gate.snapshot();
        assert_eq!(snapshot.outstanding, 0);
        assert_eq!(snapshot.acquired_total, snapshot.released_total);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        assert_eq!(AdmissionGate::new(0).capacity(), 1);
    }
}

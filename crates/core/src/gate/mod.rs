//! Resizable admission control bounding how many jobs hold an active stage.
//!
//! The limit is a single atomic read only when an admission decision is
//! made. Shrinking it never evicts permit holders; it only blocks new
//! admissions until enough permits have been dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("admission wait cancelled")]
    Cancelled,
}

/// Counting gate with a limit that can change while jobs are in flight.
#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: AtomicUsize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    released: Notify,
}

impl ConcurrencyGate {
    /// Creates a gate. A limit of zero is raised to one.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit.max(1)),
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            released: Notify::new(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest `in_use` value ever admitted.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Changes the limit and returns the value applied (at least 1).
    pub fn resize(&self, new_limit: usize) -> usize {
        let applied = new_limit.max(1);
        let previous = self.limit.swap(applied, Ordering::AcqRel);
        if previous != applied {
            info!(previous, limit = applied, in_use = self.in_use(), "Concurrency limit changed");
        }
        // Growing the limit may admit waiters right away.
        self.released.notify_waiters();
        applied
    }

    /// Admits without waiting, or returns `None` when the gate is full.
    pub fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        if self.try_admit() {
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Waits until `in_use < limit`, then takes a slot.
    ///
    /// Returns `GateError::Cancelled` as soon as `cancel` fires.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, GateError> {
        loop {
            if cancel.is_cancelled() {
                return Err(GateError::Cancelled);
            }

            // Register interest before checking so a release between the
            // check and the await is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return Ok(permit);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    fn try_admit(&self) -> bool {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let limit = self.limit.load(Ordering::Acquire);
            if current >= limit {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + 1, Ordering::AcqRel);
                    metrics::GATE_SLOTS_IN_USE.inc();
                    debug!(in_use = current + 1, limit, "Admitted job");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release_slot(&self) {
        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "gate released more often than acquired");
        metrics::GATE_SLOTS_IN_USE.dec();
        self.released.notify_waiters();
    }
}

/// A held slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl GatePermit {
    /// Releases the slot. Consumes the permit so it cannot be released twice.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn test_zero_limit_is_clamped() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.limit(), 1);
        assert_eq!(gate.resize(0), 1);
    }

    #[test]
    fn test_try_acquire_respects_limit() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_use(), 2);

        a.release();
        assert_eq!(gate.in_use(), 1);
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.peak(), 2);
    }

    #[test]
    fn test_waiter_is_woken_on_release() {
        let gate = ConcurrencyGate::new(1);
        let cancel = CancellationToken::new();
        let held = gate.try_acquire().unwrap();

        let mut waiter = task::spawn(gate.acquire(&cancel));
        assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let permit = assert_ready_ok!(waiter.poll());
        assert_eq!(gate.in_use(), 1);
        drop(permit);
        assert_eq!(gate.in_use(), 0);
    }

    #[test]
    fn test_shrink_blocks_new_admissions_without_evicting() {
        let gate = ConcurrencyGate::new(3);
        let a = gate.try_acquire().unwrap();
        let b = gate.try_acquire().unwrap();

        gate.resize(1);
        assert_eq!(gate.in_use(), 2);
        assert!(gate.try_acquire().is_none());

        drop(a);
        assert!(gate.try_acquire().is_none());
        drop(b);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_grow_wakes_waiters() {
        let gate = ConcurrencyGate::new(1);
        let cancel = CancellationToken::new();
        let _held = gate.try_acquire().unwrap();

        let mut waiter = task::spawn(gate.acquire(&cancel));
        assert_pending!(waiter.poll());

        gate.resize(2);
        assert!(waiter.is_woken());
        let _permit = assert_ready_ok!(waiter.poll());
        assert_eq!(gate.in_use(), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let gate = ConcurrencyGate::new(1);
        let cancel = CancellationToken::new();
        let _held = gate.try_acquire().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(result, Err(GateError::Cancelled));
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_use_never_exceeds_limit_under_contention() {
        let gate = ConcurrencyGate::new(3);
        let cancel = CancellationToken::new();
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..40u64 {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            let violations = Arc::clone(&violations);
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire(&cancel).await.unwrap();
                if gate.in_use() > gate.limit().max(3) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1 + i % 3)).await;
                drop(permit);
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        gate.resize(2);

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(gate.in_use(), 0);
        assert!(gate.peak() <= 3);
    }
}

//! Concurrency gate behavior under contention and live resizes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use mps_relay_core::ConcurrencyGate;

/// Small deterministic generator so hold times vary without a rand dependency.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admissions_never_exceed_limit_across_resizes() {
    let gate = ConcurrencyGate::new(4);
    let cancel = CancellationToken::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let mut rng = Lcg(42);

    let mut tasks = JoinSet::new();
    for _ in 0..40 {
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        let hold = Duration::from_millis(1 + rng.next(8));
        tasks.spawn(async move {
            let permit = gate.acquire(&cancel).await.unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(hold).await;
            active.fetch_sub(1, Ordering::SeqCst);
            permit.release();
        });
    }

    let resizer = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            for limit in [2, 6, 1, 3] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gate.resize(limit);
            }
        })
    };

    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    resizer.await.unwrap();

    assert!(max_seen.load(Ordering::SeqCst) <= 6);
    assert!(gate.peak() <= 6);
    assert_eq!(gate.in_use(), 0);
}

#[tokio::test]
async fn test_shrink_blocks_until_holders_drain() {
    let gate = ConcurrencyGate::new(3);
    let cancel = CancellationToken::new();
    let mut held: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();

    gate.resize(1);
    assert_eq!(gate.in_use(), 3);

    let waiter = {
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        tokio::spawn(async move { gate.acquire(&cancel).await })
    };

    // Two of three holders gone: in_use 1 is still at the new limit.
    held.pop().unwrap().release();
    held.pop().unwrap().release();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    held.pop().unwrap().release();
    let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(gate.in_use(), 1);
    drop(permit);
}

#[tokio::test]
async fn test_grow_admits_waiters_immediately() {
    let gate = ConcurrencyGate::new(1);
    let cancel = CancellationToken::new();
    let _held = gate.try_acquire().unwrap();

    let waiter = {
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        tokio::spawn(async move { gate.acquire(&cancel).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    gate.resize(2);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_cancel_wakes_every_waiter() {
    let gate = ConcurrencyGate::new(1);
    let cancel = CancellationToken::new();
    let _held = gate.try_acquire().unwrap();

    let mut waiters = JoinSet::new();
    for _ in 0..5 {
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        waiters.spawn(async move { gate.acquire(&cancel).await.is_err() });
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    while let Some(result) = waiters.join_next().await {
        assert!(result.unwrap());
    }
    assert_eq!(gate.in_use(), 1);
}

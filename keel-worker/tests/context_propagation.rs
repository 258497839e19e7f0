//! Integration Tests for Context Propagation and Pool Shutdown
//!
//! **Propagation**: work submitted to a pool observes the submitter's
//! correlation fields and principal, and the worker is left clean afterwards.
//!
//! **Shutdown interrupts**: `shutdown_now` aborts interruptible lock waits
//! but leaves plain waits queued.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keel_cache::{InMemoryCache, KeyedLockManager};
use keel_core::{
    correlation_fields, correlation_value, current_principal, scoped_correlation, set_principal,
    LockError, Principal,
};
use keel_test_utils::generators::arb_execution_context;
use keel_worker::{propagating, run_in, ThreadPool, WorkerPool};
use proptest::prelude::*;

/// Correlation fields and principal visible on the current thread.
fn observe() -> (Vec<(String, String)>, Option<String>) {
    (
        correlation_fields().into_iter().collect(),
        current_principal().map(|p| p.user_id.clone()),
    )
}

// ============================================================================
// PROPAGATION
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_worker_observes_submitter_context(context in arb_execution_context()) {
        let expected = (
            context.correlation().clone().into_iter().collect::<Vec<_>>(),
            context.principal().map(|p| p.user_id.clone()),
        );
        let body = run_in(&context, || propagating(observe));
        let seen = thread::spawn(body).join().expect("worker");
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn test_pool_task_sees_submitter_fields_and_principal() {
    let pool = ThreadPool::new("propagation", 1).expect("pool");

    let _dataset = scoped_correlation("dataset", "GSE2018");
    let previous = set_principal(Some(Arc::new(Principal::new("curator", vec!["admin".into()]))));
    let task = pool
        .submit(|| (correlation_value("dataset"), current_principal().map(|p| p.user_id.clone())))
        .expect("submit");
    set_principal(previous);

    let (dataset, user) = task.join().expect("task");
    assert_eq!(dataset.as_deref(), Some("GSE2018"));
    assert_eq!(user.as_deref(), Some("curator"));
}

#[test]
fn test_worker_state_restored_after_task() {
    let pool = ThreadPool::new("restore", 1).expect("pool");
    {
        let _request = scoped_correlation("request", "r-17");
        pool.submit(|| correlation_value("request"))
            .expect("submit")
            .join()
            .expect("task");
    }

    // A raw job bypasses propagation and sees the worker's own state.
    let (tx, rx) = mpsc::channel();
    pool.execute(Box::new(move || {
        let _ = tx.send(observe());
    }))
    .expect("execute");
    let baseline = rx.recv_timeout(Duration::from_secs(2)).expect("raw job ran");
    assert_eq!(baseline, (Vec::new(), None));
}

#[test]
fn test_later_submission_does_not_inherit_earlier_context() {
    let pool = ThreadPool::new("isolation", 1).expect("pool");
    {
        let _first = scoped_correlation("owner", "first");
        pool.submit(|| ()).expect("submit").join().expect("task");
    }
    let seen = pool.submit(|| correlation_value("owner")).expect("submit").join().expect("task");
    assert_eq!(seen, None);
}

// ============================================================================
// SHUTDOWN INTERRUPTS
// ============================================================================

#[test]
fn test_shutdown_now_interrupts_only_interruptible_lock_waits() {
    let cache = Arc::new(InMemoryCache::<String, u32>::new("probes"));
    let locks = KeyedLockManager::new();
    let held = locks.acquire(cache.as_ref(), "probe".to_string(), false).lock();
    let pool = ThreadPool::new("lockers", 2).expect("pool");
    let (started_tx, started_rx) = mpsc::channel();

    let plain = {
        let cache = Arc::clone(&cache);
        let locks = locks.clone();
        let started = started_tx.clone();
        pool.submit(move || {
            let handle = locks.acquire(cache.as_ref(), "probe".to_string(), false);
            let _ = started.send(());
            let _guard = handle.lock();
        })
        .expect("submit plain")
    };

    let interruptible = {
        let cache = Arc::clone(&cache);
        let locks = locks.clone();
        pool.submit(move || {
            let handle = locks.acquire(cache.as_ref(), "probe".to_string(), false);
            let _ = started_tx.send(());
            handle.lock_interruptibly().map(|_guard| ())
        })
        .expect("submit interruptible")
    };

    for _ in 0..2 {
        started_rx.recv_timeout(Duration::from_secs(2)).expect("task started");
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(pool.shutdown_now(), 0);

    let aborted = interruptible.join().expect("interruptible task");
    assert!(matches!(aborted, Err(LockError::Interrupted { .. })));
    assert!(plain.join_timeout(Duration::from_millis(50)).is_none(), "plain wait must stay queued");

    held.release();
    assert!(plain.join().is_ok());
    assert!(pool.await_termination(Duration::from_secs(2)));
    assert_eq!(locks.active_slots(), 0);
}

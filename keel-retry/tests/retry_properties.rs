//! Property-Based Tests for the Retry Executor
//!
//! **Exhaustion count**: an always-retryable failure is invoked exactly
//! `max_attempts` times and the original failure comes back.
//!
//! **Short-circuit**: a non-retryable failure is invoked once.
//!
//! **Transient recovery**: two failures then success, under at least three
//! attempts, returns the value after exactly three invocations.
//!
//! **Wrapped causes**: `Outer(cause = Retryable)` retries like `Retryable`.

use keel_core::RetryConfig;
use keel_retry::{with_retry, Backoff, RetryClassifier, RetryPolicy};
use keel_test_utils::{fast_retry_config, Conflict, ConnectionReset, Failure, FlakyOperation, NotFound};
use proptest::prelude::*;

fn storage_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder("storage-write")
        .max_attempts(max_attempts)
        .backoff(Backoff::none())
        .retry_on::<Conflict>()
        .build()
        .expect("valid policy")
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_exhaustion_invokes_exactly_max_attempts(max_attempts in 1u32..12) {
        let op = FlakyOperation::always_failing(Failure::conflict("Gene#1"), ());
        let err = storage_policy(max_attempts)
            .execute("always conflicting", || op.call())
            .expect_err("never succeeds");

        prop_assert_eq!(op.calls(), max_attempts as usize);
        let is_conflict = matches!(err, Failure::Conflict(_));
        prop_assert!(is_conflict);
    }

    #[test]
    fn prop_non_retryable_invoked_once(max_attempts in 1u32..12) {
        let op = FlakyOperation::always_failing(Failure::not_found("Gene#1"), ());
        let err = storage_policy(max_attempts)
            .execute("missing row", || op.call())
            .expect_err("never succeeds");

        prop_assert_eq!(op.calls(), 1);
        let is_not_found = matches!(err, Failure::NotFound(NotFound { .. }));
        prop_assert!(is_not_found);
    }

    #[test]
    fn prop_recovers_within_budget(failures in 0usize..6, extra in 1u32..4) {
        let max_attempts = failures as u32 + extra;
        let op = FlakyOperation::new(failures, Failure::conflict("Gene#1"), "saved");
        let result = storage_policy(max_attempts).execute("flaky write", || op.call());

        prop_assert_eq!(result, Ok("saved"));
        prop_assert_eq!(op.calls(), failures + 1);
    }

    #[test]
    fn prop_wrapped_cause_retried_like_direct(depth in 1usize..4, max_attempts in 1u32..8) {
        let wrapped = (0..depth).fold(Failure::conflict("Gene#1"), |inner, level| {
            Failure::wrapped(format!("layer {level}"), inner)
        });
        let direct = FlakyOperation::always_failing(Failure::conflict("Gene#1"), ());
        let nested = FlakyOperation::always_failing(wrapped.clone(), ());

        let policy = storage_policy(max_attempts);
        let _ = policy.execute("direct", || direct.call());
        let err = policy.execute("nested", || nested.call()).expect_err("never succeeds");

        prop_assert_eq!(direct.calls(), nested.calls());
        prop_assert_eq!(err, wrapped);
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_two_failures_then_success_takes_three_calls() {
    let op = FlakyOperation::new(2, Failure::conflict("ExpressionExperiment#3"), 42);
    let result = storage_policy(3).execute("save", || op.call());
    assert_eq!(result, Ok(42));
    assert_eq!(op.calls(), 3);
}

#[test]
fn test_transport_policy_from_config() {
    let classifier = RetryClassifier::new()
        .retry_on::<ConnectionReset>()
        .never_retry_if(|e: &ConnectionReset| e.host.ends_with(".oversized"));
    let policy = RetryPolicy::from_config("geo-fetch", &fast_retry_config(3), classifier).expect("valid");

    let transient = FlakyOperation::new(1, Failure::connection_reset("ftp.ncbi"), "ok");
    assert_eq!(policy.execute("listing", || transient.call()), Ok("ok"));
    assert_eq!(transient.calls(), 2);

    let oversized = FlakyOperation::always_failing(Failure::connection_reset("record.oversized"), ());
    assert!(policy.execute("record", || oversized.call()).is_err());
    assert_eq!(oversized.calls(), 1);
}

#[test]
fn test_lowering_attempts_for_tests() {
    let mut policy = RetryPolicy::from_config(
        "storage-write",
        &RetryConfig::default(),
        RetryClassifier::new().retry_on::<Conflict>(),
    )
    .expect("default config is valid");
    policy.set_max_attempts(1).expect("one attempt is valid");
    policy.set_backoff(Backoff::none()).expect("zero backoff is valid");

    let op = FlakyOperation::always_failing(Failure::conflict("x"), ());
    assert!(policy.execute("single shot", || op.call()).is_err());
    assert_eq!(op.calls(), 1);
}

#[test]
fn test_with_retry_preserves_signature() {
    let op = FlakyOperation::new(1, Failure::wrapped("outer", Failure::conflict("x")), 9u8);
    let mut save = with_retry(storage_policy(2), "save", || op.call());
    let value: Result<u8, Failure> = save();
    assert_eq!(value, Ok(9));
}

//! KEEL Test Utilities
//!
//! Shared test infrastructure for the KEEL workspace:
//! - Failure fixtures mirroring storage, transport and business failures
//! - Flaky operations with invocation counting
//! - Proptest generators for keys, correlation fields and principals
//! - Fast retry configuration for test harnesses

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

// Re-export core types for convenience
pub use keel_core::{
    is_interruption, ExecutionContext, InterruptToken, Interrupted, Principal, RetryConfig,
};

// ============================================================================
// FAILURE FIXTURES
// ============================================================================

/// Conflicting-update signal from a storage layer (retryable kind).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Conflicting update on {entity}")]
pub struct Conflict {
    pub entity: String,
}

/// Transport failure from a network layer (retryable kind).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Connection reset by {host}")]
pub struct ConnectionReset {
    pub host: String,
}

/// Business failure: the resource does not exist (never retryable).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("No such resource: {what}")]
pub struct NotFound {
    pub what: String,
}

/// Wrapper failure that hides another fixture as its cause.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{context}")]
pub struct Wrapped {
    pub context: String,
    #[source]
    pub source: Box<Failure>,
}

/// Any fixture failure. Each variant exposes its payload as `source()`, so a
/// cause-chain walk from a `Failure` reaches the concrete fixture type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Failure {
    #[error("{0}")]
    Conflict(#[from] Conflict),

    #[error("{0}")]
    ConnectionReset(#[from] ConnectionReset),

    #[error("{0}")]
    NotFound(#[from] NotFound),

    #[error("{0}")]
    Wrapped(#[from] Wrapped),

    #[error("{0}")]
    Interrupted(#[from] Interrupted),
}

impl Failure {
    pub fn conflict(entity: impl Into<String>) -> Self {
        Conflict {
            entity: entity.into(),
        }
        .into()
    }

    pub fn connection_reset(host: impl Into<String>) -> Self {
        ConnectionReset { host: host.into() }.into()
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        NotFound { what: what.into() }.into()
    }

    /// Wrap `inner` under an outer failure carrying `context`.
    pub fn wrapped(context: impl Into<String>, inner: impl Into<Failure>) -> Self {
        Wrapped {
            context: context.into(),
            source: Box::new(inner.into()),
        }
        .into()
    }

    pub fn interrupted(what: impl Into<String>) -> Self {
        Interrupted::new(what).into()
    }
}

// ============================================================================
// FLAKY OPERATIONS
// ============================================================================

/// Operation that fails a fixed number of times, then succeeds.
///
/// Every call is counted, including the successful ones, so tests can assert
/// exact attempt counts.
#[derive(Debug)]
pub struct FlakyOperation<T, E> {
    failures: usize,
    error: E,
    value: T,
    calls: AtomicUsize,
}

impl<T: Clone, E: Clone> FlakyOperation<T, E> {
    /// Fail `failures` times with `error`, then return `value`.
    pub fn new(failures: usize, error: E, value: T) -> Self {
        Self {
            failures,
            error,
            value,
            calls: AtomicUsize::new(0),
        }
    }

    /// Never succeed.
    pub fn always_failing(error: E, value: T) -> Self {
        Self::new(usize::MAX, error, value)
    }

    pub fn call(&self) -> Result<T, E> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(self.error.clone())
        } else {
            Ok(self.value.clone())
        }
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ============================================================================
// CONFIGURATION FIXTURES
// ============================================================================

/// Retry configuration with no backoff, for fast test harnesses.
pub fn fast_retry_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff_ms: 0,
        backoff_multiplier: 1.0,
        max_backoff_ms: 0,
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for lock keys and execution context.

    use super::*;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Short, readable cache keys drawn from a small alphabet so that
    /// collisions are common.
    pub fn arb_lock_key() -> impl Strategy<Value = String> {
        "[a-d]{1,3}"
    }

    /// Sequence of keys to churn through.
    pub fn arb_key_churn(max_len: usize) -> impl Strategy<Value = Vec<String>> {
        vec(arb_lock_key(), 1..=max_len)
    }

    /// Correlation fields as installed on a thread.
    pub fn arb_correlation_fields() -> impl Strategy<Value = BTreeMap<String, String>> {
        btree_map("[a-z_]{1,12}", "[A-Za-z0-9-]{1,24}", 0..6)
    }

    /// Principal with a handful of roles.
    pub fn arb_principal() -> impl Strategy<Value = Principal> {
        ("[a-z]{3,10}", vec("[a-z]{3,8}", 0..4))
            .prop_map(|(user, roles)| Principal::new(user, roles))
    }

    /// Full execution context snapshot.
    pub fn arb_execution_context() -> impl Strategy<Value = ExecutionContext> {
        (arb_correlation_fields(), proptest::option::of(arb_principal())).prop_map(
            |(fields, principal)| {
                let context = fields
                    .into_iter()
                    .fold(ExecutionContext::empty(), |ctx, (k, v)| ctx.with_correlation(k, v));
                match principal {
                    Some(principal) => context.with_principal(principal),
                    None => context,
                }
            },
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for failure chains.

    use std::error::Error as StdError;

    /// Assert that `err` or one of its causes is a `T`.
    pub fn assert_caused_by<T: StdError + 'static>(err: &(dyn StdError + 'static)) {
        assert!(
            keel_core::chain(err).any(|e| e.is::<T>()),
            "Expected {} in cause chain of: {}",
            std::any::type_name::<T>(),
            err
        );
    }

    /// Assert that `err` is an interruption somewhere in its chain.
    pub fn assert_interrupted(err: &(dyn StdError + 'static)) {
        assert!(super::is_interruption(err), "Expected interruption, got: {}", err);
    }
}

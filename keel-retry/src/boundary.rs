//! Retry decorators.
//!
//! Retrying is attached where an operation is defined, not where it is
//! called. Three shapes are offered:
//!
//! - [`with_retry`] turns a closure into a retrying closure.
//! - [`RetryBoundary`] lets a type whose methods sit on a transient-failure
//!   prone boundary (storage writes) wrap its own method bodies.
//! - [`Retrying`] decorates an existing value so every call made through it
//!   runs under a policy.
//!
//! In every shape the whole operation is re-entered on retry; there is no
//! resumption from the point of failure.

use std::error::Error as StdError;

use crate::policy::RetryPolicy;

/// Wrap `operation` so each call runs under `policy`.
///
/// Callers see the same signature and failure type as the bare operation;
/// only latency and attempt count differ.
pub fn with_retry<T, E, F>(policy: RetryPolicy, what: impl Into<String>, mut operation: F) -> impl FnMut() -> Result<T, E>
where
    E: StdError + 'static,
    F: FnMut() -> Result<T, E>,
{
    let what = what.into();
    move || policy.execute(&what, &mut operation)
}

/// A type whose operations retry themselves under one policy.
///
/// ```ignore
/// impl RetryBoundary for ExperimentStore {
///     fn retry_policy(&self) -> &RetryPolicy {
///         &self.policy
///     }
/// }
///
/// impl ExperimentStore {
///     pub fn save(&self, e: &Experiment) -> Result<(), StoreError> {
///         self.retrying("saving experiment", || self.write(e))
///     }
/// }
/// ```
pub trait RetryBoundary {
    fn retry_policy(&self) -> &RetryPolicy;

    fn retrying<T, E, F>(&self, what: &str, operation: F) -> Result<T, E>
    where
        E: StdError + 'static,
        F: FnMut() -> Result<T, E>,
    {
        self.retry_policy().execute(what, operation)
    }
}

/// Decorator running every call on the wrapped value under a policy.
#[derive(Debug, Clone)]
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Invoke `operation` on the wrapped value, retrying per the policy.
    pub fn call<T, E, F>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: StdError + 'static,
        F: FnMut(&S) -> Result<T, E>,
    {
        let inner = &self.inner;
        self.policy.execute(what, || operation(inner))
    }

    /// Mutable variant of [`call`](Self::call).
    pub fn call_mut<T, E, F>(&mut self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: StdError + 'static,
        F: FnMut(&mut S) -> Result<T, E>,
    {
        let Self { inner, policy } = self;
        policy.execute(what, || operation(&mut *inner))
    }
}

impl<S> RetryBoundary for Retrying<S> {
    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

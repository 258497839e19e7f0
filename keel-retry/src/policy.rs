//! Retry policies and the synchronous attempt loop.
//!
//! A policy is built once per category of operation ("pessimistic-lock
//! sensitive database write", "remote file listing") and shared across many
//! calls. Each call runs its own attempt sequence:
//!
//! ```text
//! attempt 1 ── Ok ─────────────────────────────→ return value
//!     │
//!     Err ── not retryable ────────────────────→ return error
//!     │
//!     Err ── retryable, attempt == max ────────→ return error
//!     │
//!     Err ── retryable ── backoff ── attempt n+1
//!                            │
//!                            interrupted ──────→ return error
//! ```
//!
//! The error handed back is always the operation's own, unwrapped.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use keel_core::{interrupt, ConfigError, RetryConfig};

use crate::backoff::Backoff;
use crate::classifier::RetryClassifier;

/// Position of one call within its attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl RetryContext {
    pub fn is_first(&self) -> bool {
        self.attempt == 1
    }

    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Attempt limit, backoff and failure classification for one category of
/// operation.
#[derive(Clone)]
pub struct RetryPolicy {
    name: Arc<str>,
    max_attempts: u32,
    backoff: Backoff,
    classifier: RetryClassifier,
}

impl RetryPolicy {
    pub fn builder(name: impl Into<String>) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(name)
    }

    /// Build a policy from validated configuration.
    pub fn from_config(
        name: impl Into<String>,
        config: &RetryConfig,
        classifier: RetryClassifier,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::builder(name)
            .max_attempts(config.max_attempts)
            .backoff(Backoff::from_config(config))
            .classifier(classifier)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn classifier(&self) -> &RetryClassifier {
        &self.classifier
    }

    /// Change the attempt limit. Takes effect for sequences started later.
    pub fn set_max_attempts(&mut self, max_attempts: u32) -> Result<(), ConfigError> {
        self.max_attempts = validate_attempts(max_attempts)?;
        Ok(())
    }

    /// Replace the backoff. Rejected, leaving the old one, if invalid.
    pub fn set_backoff(&mut self, backoff: Backoff) -> Result<(), ConfigError> {
        backoff.validate()?;
        self.backoff = backoff;
        Ok(())
    }

    pub fn is_retryable(&self, err: &(dyn StdError + 'static)) -> bool {
        self.classifier.is_retryable(err)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or has been invoked `max_attempts` times.
    ///
    /// `what` describes the operation in logs.
    pub fn execute<T, E, F>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: StdError + 'static,
        F: FnMut() -> Result<T, E>,
    {
        self.execute_with_context(what, |_| operation())
    }

    /// [`execute`](Self::execute), telling the operation which attempt it is.
    pub fn execute_with_context<T, E, F>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: StdError + 'static,
        F: FnMut(&RetryContext) -> Result<T, E>,
    {
        let mut ctx = RetryContext {
            attempt: 1,
            max_attempts: self.max_attempts,
        };
        loop {
            let err = match operation(&ctx) {
                Ok(value) => {
                    if !ctx.is_first() {
                        tracing::debug!(policy = %self.name, what, attempt = ctx.attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let delay = match self.next_delay(what, &ctx, &err) {
                Some(delay) => delay,
                None => return Err(err),
            };

            if let Err(interrupted) = interrupt::sleep(delay) {
                tracing::debug!(policy = %self.name, what, attempt = ctx.attempt, reason = %interrupted, "Retry abandoned");
                return Err(err);
            }
            ctx.attempt += 1;
        }
    }

    /// Decide whether a failed attempt is followed by another, and after
    /// what delay. Logs the decision.
    pub(crate) fn next_delay(
        &self,
        what: &str,
        ctx: &RetryContext,
        err: &(dyn StdError + 'static),
    ) -> Option<std::time::Duration> {
        if !self.classifier.is_retryable(err) {
            tracing::debug!(policy = %self.name, what, attempt = ctx.attempt, error = %err, "Failure is not retryable");
            return None;
        }
        if ctx.is_last() {
            tracing::warn!(
                policy = %self.name,
                what,
                attempts = ctx.attempt,
                error = %err,
                "Retry attempts exhausted"
            );
            return None;
        }
        let delay = self.backoff.delay_for(ctx.attempt);
        tracing::debug!(
            policy = %self.name,
            what,
            attempt = ctx.attempt,
            max_attempts = ctx.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        Some(delay)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("classifier", &self.classifier)
            .finish()
    }
}

fn validate_attempts(max_attempts: u32) -> Result<u32, ConfigError> {
    if max_attempts == 0 {
        return Err(ConfigError::InvalidValue {
            field: "retry.max_attempts",
            reason: "must be >= 1".to_string(),
        });
    }
    Ok(max_attempts)
}

/// Builder for [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    name: String,
    max_attempts: u32,
    backoff: Backoff,
    classifier: RetryClassifier,
}

impl RetryPolicyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let defaults = RetryConfig::default();
        Self {
            name: name.into(),
            max_attempts: defaults.max_attempts,
            backoff: Backoff::from_config(&defaults),
            classifier: RetryClassifier::new(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// See [`RetryClassifier::retry_on`].
    pub fn retry_on<T: StdError + 'static>(mut self) -> Self {
        self.classifier = self.classifier.retry_on::<T>();
        self
    }

    /// See [`RetryClassifier::retry_on_if`].
    pub fn retry_on_if<T, F>(mut self, predicate: F) -> Self
    where
        T: StdError + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.classifier = self.classifier.retry_on_if::<T, F>(predicate);
        self
    }

    /// See [`RetryClassifier::never_retry`].
    pub fn never_retry<T: StdError + 'static>(mut self) -> Self {
        self.classifier = self.classifier.never_retry::<T>();
        self
    }

    /// See [`RetryClassifier::never_retry_if`].
    pub fn never_retry_if<T, F>(mut self, predicate: F) -> Self
    where
        T: StdError + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.classifier = self.classifier.never_retry_if::<T, F>(predicate);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        self.backoff.validate()?;
        Ok(RetryPolicy {
            name: Arc::from(self.name),
            max_attempts: validate_attempts(self.max_attempts)?,
            backoff: self.backoff,
            classifier: self.classifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::InterruptToken;
    use keel_test_utils::{fast_retry_config, Conflict, Failure, FlakyOperation};
    use std::time::{Duration, Instant};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder("test")
            .max_attempts(max_attempts)
            .backoff(Backoff::none())
            .retry_on::<Conflict>()
            .build()
            .expect("valid policy")
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RetryPolicy::builder("bad").max_attempts(0).build().is_err());
        let mut ok = policy(3);
        assert!(ok.set_max_attempts(0).is_err());
        assert_eq!(ok.max_attempts(), 3);
        ok.set_max_attempts(1).expect("lowered");
        assert_eq!(ok.max_attempts(), 1);
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = fast_retry_config(4);
        let policy = RetryPolicy::from_config("cfg", &config, RetryClassifier::new()).expect("valid");
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.backoff().delay_for(3), Duration::ZERO);

        config.backoff_multiplier = 0.5;
        assert!(RetryPolicy::from_config("cfg", &config, RetryClassifier::new()).is_err());
    }

    #[test]
    fn test_invalid_backoff_rejected_at_build() {
        let negative = Backoff::exponential(Duration::from_millis(5), -2.0, Duration::from_secs(1));
        let err = RetryPolicy::builder("negative")
            .backoff(negative)
            .retry_on::<Conflict>()
            .build()
            .expect_err("negative multiplier");
        assert!(matches!(err, ConfigError::InvalidValue { field: "retry.backoff_multiplier", .. }));

        let mut ok = policy(3);
        assert!(ok.set_backoff(negative).is_err());
        assert_eq!(ok.backoff(), &Backoff::none());
    }

    #[test]
    fn test_builder_deny_predicate() {
        let policy = RetryPolicy::builder("predicate")
            .max_attempts(4)
            .backoff(Backoff::none())
            .retry_on::<Conflict>()
            .never_retry_if(|e: &Conflict| e.entity.starts_with("locked:"))
            .build()
            .expect("valid policy");

        let transient = FlakyOperation::always_failing(Failure::conflict("Gene#2"), ());
        assert!(policy.execute("transient", || transient.call()).is_err());
        assert_eq!(transient.calls(), 4);

        let locked = FlakyOperation::always_failing(Failure::conflict("locked:Gene#2"), ());
        assert!(policy.execute("locked", || locked.call()).is_err());
        assert_eq!(locked.calls(), 1);
    }

    #[test]
    fn test_success_on_first_attempt() {
        let op = FlakyOperation::new(0, Failure::conflict("x"), "done");
        assert_eq!(policy(3).execute("noop", || op.call()), Ok("done"));
        assert_eq!(op.calls(), 1);
    }

    #[test]
    fn test_context_counts_attempts() {
        let mut seen = Vec::new();
        let result: Result<(), Failure> = policy(3).execute_with_context("counting", |ctx| {
            seen.push((ctx.attempt, ctx.is_last()));
            Err(Failure::conflict("x"))
        });
        assert!(result.is_err());
        assert_eq!(seen, vec![(1, false), (2, false), (3, true)]);
    }

    #[test]
    fn test_backoff_applied_between_attempts() {
        let policy = RetryPolicy::builder("slow")
            .max_attempts(3)
            .backoff(Backoff::fixed(Duration::from_millis(15)))
            .retry_on::<Conflict>()
            .build()
            .expect("valid policy");
        let op = FlakyOperation::new(2, Failure::conflict("x"), ());
        let started = Instant::now();
        assert!(policy.execute("sleepy", || op.call()).is_ok());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_interrupted_backoff_returns_last_error() {
        let policy = RetryPolicy::builder("interruptible")
            .max_attempts(5)
            .backoff(Backoff::fixed(Duration::from_secs(60)))
            .retry_on::<Conflict>()
            .build()
            .expect("valid policy");
        let token = InterruptToken::new();
        let op = FlakyOperation::always_failing(Failure::conflict("Gene#9"), ());

        let _scope = token.install();
        token.interrupt();
        let started = Instant::now();
        let err = policy.execute("blocked", || op.call()).expect_err("fails");
        assert_eq!(err, Failure::conflict("Gene#9"));
        assert_eq!(op.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

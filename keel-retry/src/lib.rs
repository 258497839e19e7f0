//! KEEL Retry - Policy-Driven Retry and Fallback
//!
//! Re-runs operations that fail with transient errors, classified by walking
//! the full `source()` chain so that a retryable failure wrapped inside
//! another error is still recognized. The caller always gets back its own
//! error type, unwrapped, after at most `max_attempts` invocations.
//!
//! ```ignore
//! use keel_retry::{Backoff, RetryPolicy};
//!
//! let policy = RetryPolicy::builder("experiment-write")
//!     .max_attempts(3)
//!     .retry_on::<ConflictError>()
//!     .build()?;
//!
//! let saved = policy.execute("saving experiment", || store.save(&experiment))?;
//! ```

pub mod async_retry;
pub mod backoff;
pub mod boundary;
pub mod classifier;
pub mod fallback;
pub mod policy;

pub use async_retry::{fetch_first, FetchSource};
pub use backoff::Backoff;
pub use boundary::{with_retry, RetryBoundary, Retrying};
pub use classifier::RetryClassifier;
pub use fallback::Fallback;
pub use policy::{RetryContext, RetryPolicy, RetryPolicyBuilder};

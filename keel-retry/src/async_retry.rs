//! Async retry and fallback for network fetches.
//!
//! Same semantics as the synchronous shells; the inter-attempt wait is a
//! `tokio` timer instead of a blocking sleep.

use std::error::Error as StdError;
use std::future::Future;

use async_trait::async_trait;
use keel_core::is_interruption;

use crate::policy::{RetryContext, RetryPolicy};

impl RetryPolicy {
    /// Async counterpart of [`RetryPolicy::execute_with_context`].
    pub async fn execute_async<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: StdError + 'static,
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut ctx = RetryContext {
            attempt: 1,
            max_attempts: self.max_attempts(),
        };
        loop {
            let err = match operation(ctx).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(delay) = self.next_delay(what, &ctx, &err) else {
                return Err(err);
            };
            tokio::time::sleep(delay).await;
            ctx.attempt += 1;
        }
    }
}

/// One way of fetching a remote resource (a mirror, a protocol).
#[async_trait]
pub trait FetchSource: Send + Sync {
    type Output: Send;
    type Error: StdError + Send + 'static;

    /// Short name used in logs.
    fn label(&self) -> &str;

    async fn fetch(&self) -> Result<Self::Output, Self::Error>;
}

/// Fetch from `primary`, falling back to each of `fallbacks` in order.
///
/// Returns the first success, or the last failure once every source has
/// failed. Failures before the last are logged at debug level.
pub async fn fetch_first<T, E>(
    what: &str,
    primary: &dyn FetchSource<Output = T, Error = E>,
    fallbacks: &[&dyn FetchSource<Output = T, Error = E>],
) -> Result<T, E>
where
    T: Send,
    E: StdError + Send + 'static,
{
    let total = 1 + fallbacks.len();
    let mut outcome = primary.fetch().await.map_err(|err| (primary.label(), err));

    for (position, source) in fallbacks.iter().enumerate() {
        let (failed, err) = match outcome {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        if is_interruption(&err) {
            return Err(err);
        }
        tracing::debug!(
            what,
            source = failed,
            attempt = position + 1,
            total,
            error = %err,
            "Fetch source failed, trying next"
        );
        outcome = source.fetch().await.map_err(|err| (source.label(), err));
    }

    outcome.map_err(|(label, err)| {
        tracing::warn!(what, source = label, total, error = %err, "All fetch sources failed");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_test_utils::{ConnectionReset, Failure, FlakyOperation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type DynMirror<'a> = &'a dyn FetchSource<Output = &'static str, Error = Failure>;

    struct Mirror {
        name: &'static str,
        result: Result<&'static str, Failure>,
        hits: AtomicUsize,
    }

    impl Mirror {
        fn new(name: &'static str, result: Result<&'static str, Failure>) -> Self {
            Self {
                name,
                result,
                hits: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FetchSource for Mirror {
        type Output = &'static str;
        type Error = Failure;

        fn label(&self) -> &str {
            self.name
        }

        async fn fetch(&self) -> Result<Self::Output, Self::Error> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn test_execute_async_retries_transient_failures() {
        let policy = RetryPolicy::builder("geo-fetch")
            .max_attempts(3)
            .backoff(crate::Backoff::fixed(Duration::from_millis(1)))
            .retry_on::<ConnectionReset>()
            .build()
            .expect("valid policy");
        let op = FlakyOperation::new(2, Failure::connection_reset("ftp.ncbi"), "GSE1133");
        let op = &op;

        let result = policy.execute_async("fetching", |_| async move { op.call() }).await;
        assert_eq!(result, Ok("GSE1133"));
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test]
    async fn test_execute_async_stops_on_fatal() {
        let policy = RetryPolicy::builder("geo-fetch")
            .max_attempts(5)
            .retry_on::<ConnectionReset>()
            .build()
            .expect("valid policy");
        let op = FlakyOperation::always_failing(Failure::not_found("GSE0"), ());
        let op = &op;
        let result = policy.execute_async("fetching", |_| async move { op.call() }).await;
        assert_eq!(result, Err(Failure::not_found("GSE0")));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_first_falls_through() {
        let ftp = Mirror::new("ftp", Err(Failure::connection_reset("ftp.ncbi")));
        let https = Mirror::new("https", Ok("payload"));
        let aspera = Mirror::new("aspera", Ok("unused"));

        let primary: DynMirror<'_> = &ftp;
        let fallbacks: [DynMirror<'_>; 2] = [&https, &aspera];
        let result = fetch_first("downloading GSE1133", primary, &fallbacks).await;
        assert_eq!(result, Ok("payload"));
        assert_eq!(aspera.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_first_returns_last_failure() {
        let ftp = Mirror::new("ftp", Err(Failure::connection_reset("ftp.ncbi")));
        let https = Mirror::new("https", Err(Failure::not_found("GSE1133")));

        let primary: DynMirror<'_> = &ftp;
        let fallbacks: [DynMirror<'_>; 1] = [&https];
        let result = fetch_first("downloading GSE1133", primary, &fallbacks).await;
        assert_eq!(result, Err(Failure::not_found("GSE1133")));
        assert_eq!(ftp.hits.load(Ordering::SeqCst), 1);
        assert_eq!(https.hits.load(Ordering::SeqCst), 1);
    }
}

//! Failure classification over cause chains.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use keel_core::{chain, is_interruption};

type Matcher = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Decides whether a failure is worth another attempt.
///
/// A failure is retryable when some link of its `source()` chain matches an
/// allow-list entry and no link matches a deny-list entry. Interruption is
/// never retryable, whatever the lists say.
///
/// ```ignore
/// let classifier = RetryClassifier::new()
///     .retry_on::<io::Error>()
///     .never_retry_if(|e: &io::Error| e.kind() == io::ErrorKind::InvalidData);
/// ```
#[derive(Clone, Default)]
pub struct RetryClassifier {
    retryable: Vec<Matcher>,
    fatal: Vec<Matcher>,
}

impl RetryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry when a `T` appears anywhere in the cause chain.
    pub fn retry_on<T>(self) -> Self
    where
        T: StdError + 'static,
    {
        self.retry_on_if::<T, _>(|_| true)
    }

    /// Retry when a `T` satisfying `predicate` appears in the cause chain.
    pub fn retry_on_if<T, F>(mut self, predicate: F) -> Self
    where
        T: StdError + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.retryable.push(matcher(predicate));
        self
    }

    /// Never retry when a `T` appears anywhere in the cause chain.
    pub fn never_retry<T>(self) -> Self
    where
        T: StdError + 'static,
    {
        self.never_retry_if::<T, _>(|_| true)
    }

    /// Never retry when a `T` satisfying `predicate` appears in the chain.
    pub fn never_retry_if<T, F>(mut self, predicate: F) -> Self
    where
        T: StdError + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.fatal.push(matcher(predicate));
        self
    }

    pub fn is_retryable(&self, err: &(dyn StdError + 'static)) -> bool {
        if is_interruption(err) {
            return false;
        }
        let links: Vec<_> = chain(err).collect();
        let any = |matchers: &[Matcher]| links.iter().any(|link| matchers.iter().any(|m| m(*link)));
        !any(&self.fatal) && any(&self.retryable)
    }
}

fn matcher<T, F>(predicate: F) -> Matcher
where
    T: StdError + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |err| err.downcast_ref::<T>().is_some_and(&predicate))
}

impl fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryClassifier")
            .field("retryable", &self.retryable.len())
            .field("fatal", &self.fatal.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_test_utils::{Conflict, ConnectionReset, Failure, NotFound};

    fn storage_classifier() -> RetryClassifier {
        RetryClassifier::new().retry_on::<Conflict>()
    }

    #[test]
    fn test_direct_match() {
        assert!(storage_classifier().is_retryable(&Failure::conflict("Gene#1")));
        assert!(!storage_classifier().is_retryable(&Failure::not_found("Gene#1")));
    }

    #[test]
    fn test_match_through_wrappers() {
        let err = Failure::wrapped("persisting", Failure::wrapped("flushing", Failure::conflict("Gene#1")));
        assert!(storage_classifier().is_retryable(&err));
    }

    #[test]
    fn test_empty_classifier_retries_nothing() {
        assert!(!RetryClassifier::new().is_retryable(&Failure::conflict("Gene#1")));
    }

    #[test]
    fn test_deny_list_wins() {
        let classifier = RetryClassifier::new()
            .retry_on::<ConnectionReset>()
            .never_retry::<NotFound>();
        let err = Failure::wrapped("fetching", Failure::not_found("GSE1"));
        assert!(!classifier.is_retryable(&err));
        assert!(classifier.is_retryable(&Failure::connection_reset("ftp.ncbi")));
    }

    #[test]
    fn test_predicates_narrow_matches() {
        let classifier = RetryClassifier::new()
            .retry_on::<ConnectionReset>()
            .never_retry_if(|e: &ConnectionReset| e.host == "oversized.example");
        assert!(classifier.is_retryable(&Failure::connection_reset("ftp.ncbi")));
        assert!(!classifier.is_retryable(&Failure::connection_reset("oversized.example")));
    }

    #[test]
    fn test_interruption_is_never_retryable() {
        let classifier = RetryClassifier::new().retry_on::<Failure>();
        assert!(classifier.is_retryable(&Failure::conflict("x")));
        assert!(!classifier.is_retryable(&Failure::interrupted("sleeping")));
    }
}

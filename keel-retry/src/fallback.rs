//! Retry with substitution.
//!
//! Where the retry executor re-runs the same action, a [`Fallback`] chain
//! runs a sequence of *alternative* actions (another mirror, another
//! protocol) and keeps the first success.

use std::error::Error as StdError;

use keel_core::is_interruption;

type Action<'a, T, E> = Box<dyn FnMut() -> Result<T, E> + 'a>;

/// Ordered alternatives for obtaining one result.
///
/// A chain always holds at least one alternative. Failures of all but the
/// last alternative are logged at debug level; if every alternative fails,
/// the last failure is logged at warn level and returned unchanged. An
/// interruption stops the chain immediately.
///
/// ```ignore
/// let path = Fallback::new("downloading GSE1133", "ftp", || ftp.fetch(&url))
///     .or_else("https", || http.fetch(&url))
///     .run()?;
/// ```
pub struct Fallback<'a, T, E> {
    what: String,
    first: (String, Action<'a, T, E>),
    rest: Vec<(String, Action<'a, T, E>)>,
}

impl<'a, T, E> Fallback<'a, T, E>
where
    E: StdError + 'static,
{
    pub fn new<F>(what: impl Into<String>, label: impl Into<String>, action: F) -> Self
    where
        F: FnMut() -> Result<T, E> + 'a,
    {
        Self {
            what: what.into(),
            first: (label.into(), Box::new(action)),
            rest: Vec::new(),
        }
    }

    /// Append an alternative tried after every earlier one has failed.
    pub fn or_else<F>(mut self, label: impl Into<String>, action: F) -> Self
    where
        F: FnMut() -> Result<T, E> + 'a,
    {
        self.rest.push((label.into(), Box::new(action)));
        self
    }

    /// Number of alternatives in the chain.
    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Try each alternative in order.
    pub fn run(self) -> Result<T, E> {
        let total = self.len();
        let what = self.what;
        let (first_label, mut first) = self.first;

        let mut outcome = first().map_err(|err| (first_label, err));
        for (position, (label, mut action)) in self.rest.into_iter().enumerate() {
            let (failed, err) = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            if is_interruption(&err) {
                tracing::debug!(what = %what, alternative = %failed, "Fallback chain interrupted");
                return Err(err);
            }
            tracing::debug!(
                what = %what,
                alternative = %failed,
                attempt = position + 1,
                total,
                error = %err,
                "Alternative failed, trying next"
            );
            outcome = action().map_err(|err| (label, err));
        }

        outcome.map_err(|(label, err)| {
            if !is_interruption(&err) {
                tracing::warn!(what = %what, alternative = %label, total, error = %err, "All alternatives failed");
            }
            err
        })
    }
}

impl<T, E> std::fmt::Debug for Fallback<'_, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = std::iter::once(self.first.0.as_str())
            .chain(self.rest.iter().map(|(label, _)| label.as_str()))
            .collect();
        f.debug_struct("Fallback")
            .field("what", &self.what)
            .field("alternatives", &labels)
            .finish()
    }
}

//! Bounded-range parallel map.
//!
//! Fans `f(i)` for every `i` in a range out over a [`WorkerPool`] and
//! gathers the results in index order. In fail-fast mode the caller gets a
//! single deterministic failure: the lowest-index one. The map waits only
//! until every index below the lowest failure seen so far has settled, then
//! cancels everything still queued or running.

use std::error::Error as StdError;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::RecvTimeoutError;
use keel_core::{interrupt, PoolError};
use thiserror::Error;

use crate::panic::panic_message;
use crate::pool::{submit, TaskHandle, WorkerPool};

/// How the map reacts to failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Return the lowest-index failure and cancel outstanding work.
    #[default]
    FailFast,
    /// Run every index, then report all failures together.
    CollectAll,
}

impl FailMode {
    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            FailMode::FailFast
        } else {
            FailMode::CollectAll
        }
    }
}

/// Failure of a parallel range map.
#[derive(Debug, Error)]
pub enum RangeMapError<E> {
    /// The function's own failure, displayed unchanged; `index` says where.
    #[error("{source}")]
    Failed {
        index: usize,
        #[source]
        source: E,
    },

    #[error("Index {index} panicked: {message}")]
    Panicked { index: usize, message: String },

    #[error("Index {index} was cancelled")]
    Cancelled { index: usize },

    #[error("Worker pool rejected work: {0}")]
    Rejected(#[source] PoolError),

    #[error("{} of {total} indices failed", .failures.len())]
    Multiple {
        failures: Vec<RangeMapError<E>>,
        total: usize,
    },
}

impl<E> RangeMapError<E> {
    /// Index the failure belongs to, if it belongs to exactly one.
    pub fn index(&self) -> Option<usize> {
        match self {
            RangeMapError::Failed { index, .. }
            | RangeMapError::Panicked { index, .. }
            | RangeMapError::Cancelled { index } => Some(*index),
            RangeMapError::Rejected(_) | RangeMapError::Multiple { .. } => None,
        }
    }

    /// The function's own error, for [`RangeMapError::Failed`].
    pub fn into_source(self) -> Option<E> {
        match self {
            RangeMapError::Failed { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn source_ref(&self) -> Option<&E> {
        match self {
            RangeMapError::Failed { source, .. } => Some(source),
            _ => None,
        }
    }
}

type Outcome<T, E> = Result<T, RangeMapError<E>>;

/// Apply `f` to every index in `range` on `pool`, preserving index order.
///
/// An empty range returns an empty vector without submitting anything. The
/// calling thread blocks until the required results are in; it must not be
/// a worker of a pool too small to make progress without it.
///
/// If the calling thread is interrupted while waiting, outstanding work is
/// cancelled and the first unsettled index is reported as cancelled.
pub fn parallel_map_range<T, E, F, P>(
    f: F,
    range: Range<usize>,
    pool: &P,
    mode: FailMode,
) -> Result<Vec<T>, RangeMapError<E>>
where
    T: Send + 'static,
    E: StdError + Send + 'static,
    F: Fn(usize) -> Result<T, E> + Send + Sync + 'static,
    P: WorkerPool + ?Sized,
{
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let start = range.start;
    let total = range.len();
    let f = Arc::new(f);
    let (tx, rx) = crossbeam_channel::unbounded::<(usize, Outcome<T, E>)>();

    let mut handles: Vec<TaskHandle<()>> = Vec::with_capacity(total);
    for index in range {
        let f = Arc::clone(&f);
        let tx = tx.clone();
        let submitted = submit(pool, move || {
            if interrupt::is_interrupted() {
                return;
            }
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f(index))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(RangeMapError::Failed { index, source }),
                Err(payload) => Err(RangeMapError::Panicked {
                    index,
                    message: panic_message(&*payload),
                }),
            };
            let _ = tx.send((index, outcome));
        });
        match submitted {
            Ok(handle) => handles.push(handle),
            Err(rejected) => {
                cancel_all(&handles);
                return Err(RangeMapError::Rejected(rejected));
            }
        }
    }
    drop(tx);

    let mut slots: Vec<Option<Outcome<T, E>>> = (0..total).map(|_| None).collect();
    let mut settled_prefix = 0;
    let mut lowest_failure: Option<usize> = None;
    let token = interrupt::current();

    loop {
        while settled_prefix < total && slots[settled_prefix].is_some() {
            settled_prefix += 1;
        }
        if settled_prefix == total {
            break;
        }
        if mode == FailMode::FailFast && lowest_failure.is_some_and(|lowest| settled_prefix >= lowest) {
            break;
        }

        let received = match &token {
            Some(token) => match rx.recv_timeout(interrupt::DEFAULT_POLL_INTERVAL) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => {
                    if token.is_interrupted() {
                        cancel_all(&handles);
                        tracing::debug!(index = start + settled_prefix, "Parallel map interrupted");
                        return Err(RangeMapError::Cancelled {
                            index: start + settled_prefix,
                        });
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => rx.recv().ok(),
        };

        let Some((index, outcome)) = received else {
            // Every task is gone; whatever never reported was dropped unrun.
            for (offset, slot) in slots.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(Err(RangeMapError::Cancelled { index: start + offset }));
                    lowest_failure = Some(lowest_failure.map_or(offset, |l| l.min(offset)));
                }
            }
            continue;
        };

        let offset = index - start;
        if outcome.is_err() {
            lowest_failure = Some(lowest_failure.map_or(offset, |l| l.min(offset)));
        }
        slots[offset] = Some(outcome);
    }

    if mode == FailMode::FailFast {
        if let Some(lowest) = lowest_failure {
            cancel_all(&handles);
            return Err(fail_fast_result(slots, lowest));
        }
    }

    let mut values = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for outcome in slots.into_iter().flatten() {
        match outcome {
            Ok(value) => values.push(value),
            Err(err) => failures.push(err),
        }
    }
    if failures.is_empty() {
        Ok(values)
    } else {
        tracing::debug!(failed = failures.len(), total, "Parallel map completed with failures");
        Err(RangeMapError::Multiple { failures, total })
    }
}

fn fail_fast_result<T, E>(slots: Vec<Option<Outcome<T, E>>>, lowest: usize) -> RangeMapError<E>
where
    E: StdError,
{
    let mut representative = None;
    for (offset, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(Err(err)) if offset == lowest => representative = Some(err),
            Some(Err(err)) => tracing::debug!(error = %err, "Additional parallel map failure"),
            _ => {}
        }
    }
    let err = representative.unwrap_or(RangeMapError::Cancelled { index: lowest });
    tracing::debug!(error = %err, "Parallel map failed fast");
    err
}

fn cancel_all(handles: &[TaskHandle<()>]) {
    let cancelled = handles.iter().filter(|handle| handle.cancel()).count();
    if cancelled > 0 {
        tracing::trace!(cancelled, "Cancelled outstanding parallel map tasks");
    }
}

//! Context-propagating worker factory.
//!
//! Pool threads are reused across unrelated logical operations. Every body
//! handed to a worker therefore carries the [`ExecutionContext`] of the
//! thread that created it, installs it before running, and restores the
//! worker's prior (usually empty) state afterwards, whether the body returns
//! or unwinds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use keel_core::{ExecutionContext, PoolError, WorkerConfig};

/// Capture the calling thread's context now; run `body` under it later.
pub fn propagating<F, R>(body: F) -> impl FnOnce() -> R + Send + 'static
where
    F: FnOnce() -> R + Send + 'static,
    R: 'static,
{
    let context = ExecutionContext::capture();
    move || run_in(&context, body)
}

/// Run `body` with `context` installed and its span entered.
pub fn run_in<F, R>(context: &ExecutionContext, body: F) -> R
where
    F: FnOnce() -> R,
{
    let _scope = context.install();
    let span = context.span();
    let _entered = span.enter();
    body()
}

/// Creates named worker threads that inherit the creator's context.
#[derive(Debug)]
pub struct WorkerFactory {
    prefix: String,
    counter: AtomicUsize,
}

impl WorkerFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.thread_name_prefix.clone())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next thread name: the prefix followed by a 1-based sequence number.
    pub fn next_name(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", self.prefix, n)
    }

    /// Wrap `body` so it runs under the context captured right now.
    pub fn wrap<F, R>(&self, body: F) -> impl FnOnce() -> R + Send + 'static
    where
        F: FnOnce() -> R + Send + 'static,
        R: 'static,
    {
        propagating(body)
    }

    /// Start a dedicated thread running `body` under the creator's context.
    pub fn new_worker<F, R>(&self, body: F) -> Result<JoinHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let name = self.next_name();
        let body = self.wrap(body);
        tracing::trace!(worker = %name, "Spawning worker thread");
        thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| PoolError::Spawn {
                pool: self.prefix.clone(),
                reason: format!("{name}: {e}"),
            })
    }
}

impl Default for WorkerFactory {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

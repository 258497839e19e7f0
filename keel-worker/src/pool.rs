//! Worker pools.
//!
//! A [`WorkerPool`] accepts boxed jobs; [`submit`] layers result delivery,
//! cancellation, panic capture and context propagation on top, returning a
//! [`TaskHandle`]. [`ThreadPool`] is a fixed-size pool of OS threads fed by
//! a `crossbeam-channel` queue.
//!
//! # Task lifecycle
//!
//! ```text
//! Queued ──(worker picks up)──→ Running ──(body returns/panics)──→ Done
//!   │                              │
//!   └──────── cancel() ────────────┴──→ Cancelled
//! ```
//!
//! Cancelling a queued task means it never runs. Cancelling a running task
//! interrupts its token; the body may finish anyway, but its result is
//! discarded.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use keel_core::{InterruptToken, KeelResult, PoolError, TaskError, WorkerConfig};
use parking_lot::{Condvar, Mutex};

use crate::factory::{propagating, WorkerFactory};
use crate::panic::panic_message;

/// Unit of work accepted by a pool. Dropping a job without running it is
/// how a pool cancels it.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Externally supplied executor for units of work.
pub trait WorkerPool: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Enqueue `job`. Fails once the pool is shut down.
    fn execute(&self, job: Job) -> Result<(), PoolError>;

    /// Token every task token of this pool descends from.
    fn interrupt_token(&self) -> InterruptToken;
}

// ============================================================================
// TASK HANDLE
// ============================================================================

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// Pending result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<R> {
    result: Receiver<Result<R, TaskError>>,
    state: Arc<AtomicU8>,
    token: InterruptToken,
}

impl<R> TaskHandle<R> {
    /// Wait for the task and return its result.
    ///
    /// Returns [`TaskError::Cancelled`] immediately if the task was
    /// cancelled, and also if the pool dropped it unrun.
    pub fn join(self) -> Result<R, TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let outcome = self.result.recv().unwrap_or(Err(TaskError::Cancelled));
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        outcome
    }

    /// Wait at most `timeout`; `None` if the task is still pending.
    pub fn join_timeout(&self, timeout: Duration) -> Option<Result<R, TaskError>> {
        if self.is_cancelled() {
            return Some(Err(TaskError::Cancelled));
        }
        match self.result.recv_timeout(timeout) {
            Ok(_) if self.is_cancelled() => Some(Err(TaskError::Cancelled)),
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(TaskError::Cancelled)),
        }
    }

    /// Cancel the task. Returns false if it had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                QUEUED | RUNNING => Some(CANCELLED),
                _ => None,
            })
            .is_ok();
        if cancelled {
            self.token.interrupt();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

/// Submit `body` to `pool`.
///
/// The calling thread's execution context is captured now and installed
/// around `body`; a child of the pool's interrupt token is current while it
/// runs. A panic in `body` is reported as [`TaskError::Panicked`].
pub fn submit<P, F, R>(pool: &P, body: F) -> Result<TaskHandle<R>, PoolError>
where
    P: WorkerPool + ?Sized,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    let state = Arc::new(AtomicU8::new(QUEUED));
    let token = pool.interrupt_token().child();
    let body = propagating(body);
    let pool_name = pool.name().to_string();

    let job: Job = {
        let state = Arc::clone(&state);
        let token = token.clone();
        Box::new(move || {
            if state
                .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let _ = tx.send(Err(TaskError::Cancelled));
                return;
            }
            let _scope = token.install();
            let outcome = panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
                let message = panic_message(&*payload);
                tracing::warn!(pool = %pool_name, message = %message, "Task panicked");
                TaskError::Panicked { message }
            });
            let _ = state.compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire);
            let _ = tx.send(outcome);
        })
    };

    pool.execute(job)?;
    Ok(TaskHandle {
        result: rx,
        state,
        token,
    })
}

// ============================================================================
// THREAD POOL
// ============================================================================

#[derive(Debug)]
struct Shared {
    name: String,
    token: InterruptToken,
    shutdown: AtomicBool,
    live_workers: Mutex<usize>,
    all_exited: Condvar,
}

impl Shared {
    fn worker_exited(&self) {
        let mut live = self.live_workers.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.all_exited.notify_all();
        }
    }
}

/// Fixed-size pool of named OS threads.
///
/// Lifecycle belongs to the caller: shut the pool down when done. Dropping
/// the pool performs a graceful [`shutdown`](Self::shutdown) without
/// waiting.
#[derive(Debug)]
pub struct ThreadPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    queue: Receiver<Job>,
    threads: usize,
}

impl ThreadPool {
    /// Start a pool of `threads` workers named `{name}-worker-{n}`.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self, PoolError> {
        let name = name.into();
        let factory = WorkerFactory::new(format!("{name}-worker-"));
        Self::start(name, threads, &factory)
    }

    /// Start a pool sized and named by configuration.
    pub fn from_config(name: impl Into<String>, config: &WorkerConfig) -> KeelResult<Self> {
        config.validate()?;
        let factory = WorkerFactory::from_config(config);
        Ok(Self::start(name.into(), config.threads, &factory)?)
    }

    fn start(name: String, threads: usize, factory: &WorkerFactory) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::Spawn {
                pool: name,
                reason: "thread count must be > 0".to_string(),
            });
        }

        let (sender, queue) = crossbeam_channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            name,
            token: InterruptToken::new(),
            shutdown: AtomicBool::new(false),
            live_workers: Mutex::new(0),
            all_exited: Condvar::new(),
        });
        let pool = Self {
            shared: Arc::clone(&shared),
            sender: Mutex::new(Some(sender)),
            queue: queue.clone(),
            threads,
        };

        for _ in 0..threads {
            let worker_name = factory.next_name();
            let shared = Arc::clone(&shared);
            let queue = queue.clone();
            *pool.shared.live_workers.lock() += 1;
            let spawned = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || worker_loop(&shared, &queue));
            if let Err(e) = spawned {
                pool.shared.worker_exited();
                pool.shutdown_now();
                return Err(PoolError::Spawn {
                    pool: pool.shared.name.clone(),
                    reason: format!("{worker_name}: {e}"),
                });
            }
        }

        tracing::debug!(pool = %pool.shared.name, threads, "Worker pool started");
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Submit `body`; see [`submit`].
    pub fn submit<F, R>(&self, body: F) -> Result<TaskHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        submit(self, body)
    }

    /// Stop accepting work. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            self.shared.shutdown.store(true, Ordering::Release);
            tracing::debug!(pool = %self.shared.name, "Worker pool shutting down");
        }
    }

    /// Stop accepting work, drop queued tasks and interrupt running ones.
    ///
    /// Returns the number of queued tasks that were dropped unrun.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        self.shared.token.interrupt();
        let mut dropped = 0;
        while let Ok(job) = self.queue.try_recv() {
            drop(job);
            dropped += 1;
        }
        tracing::debug!(pool = %self.shared.name, dropped, "Worker pool interrupted");
        dropped
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for every worker to exit after shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live_workers.lock();
        while *live > 0 {
            if self.shared.all_exited.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }
}

impl WorkerPool for ThreadPool {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn execute(&self, job: Job) -> Result<(), PoolError> {
        let sender = self.sender.lock();
        let shut_down = || PoolError::ShutDown {
            pool: self.shared.name.clone(),
        };
        sender.as_ref().ok_or_else(shut_down)?.send(job).map_err(|_| shut_down())
    }

    fn interrupt_token(&self) -> InterruptToken {
        self.shared.token.clone()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, queue: &Receiver<Job>) {
    while let Ok(job) = queue.recv() {
        job();
    }
    tracing::trace!(pool = %shared.name, "Worker exiting");
    shared.worker_exited();
}

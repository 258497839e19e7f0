//! KEEL Worker - Context-Propagating Pools
//!
//! Worker threads that run each body under the [`ExecutionContext`] of the
//! thread that created it, a fixed-size [`ThreadPool`] with cancellable task
//! handles, and [`parallel_map_range`] for fanning an index range out over a
//! pool with deterministic fail-fast reporting.
//!
//! ```ignore
//! use keel_worker::{parallel_map_range, FailMode, ThreadPool};
//!
//! let pool = ThreadPool::new("samples", 4)?;
//! let rows = parallel_map_range(load_sample, 0..samples.len(), &pool, FailMode::FailFast)?;
//! ```
//!
//! [`ExecutionContext`]: keel_core::ExecutionContext

pub mod factory;
pub mod panic;
pub mod parallel;
pub mod pool;

pub use factory::{propagating, run_in, WorkerFactory};
pub use panic::panic_message;
pub use parallel::{parallel_map_range, FailMode, RangeMapError};
pub use pool::{submit, Job, TaskHandle, ThreadPool, WorkerPool};

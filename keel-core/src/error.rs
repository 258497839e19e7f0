//! Error types for KEEL operations

use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Cooperative cancellation signal observed while waiting.
///
/// Interruption is never retried and never wrapped by the retry or fallback
/// shells: it always surfaces on first occurrence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Interrupted while {what}")]
pub struct Interrupted {
    pub what: String,
}

impl Interrupted {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

/// Keyed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Interrupted while waiting for lock on {key}")]
    Interrupted { key: String },

    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    TimedOut { key: String, waited: Duration },
}

/// Worker pool errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool {pool} is shut down")]
    ShutDown { pool: String },

    #[error("Failed to spawn worker for pool {pool}: {reason}")]
    Spawn { pool: String, reason: String },
}

/// Failure of a single unit of work submitted to a worker pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task panicked: {message}")]
    Panicked { message: String },

    #[error("Task was cancelled before completion")]
    Cancelled,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all KEEL errors.
#[derive(Debug, Error)]
pub enum KeelError {
    #[error("Interrupted: {0}")]
    Interrupted(#[from] Interrupted),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for KEEL operations.
pub type KeelResult<T> = Result<T, KeelError>;

/// Iterate over an error and every error in its `source()` chain.
pub fn chain<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// True if any link of the cause chain is an interruption.
///
/// Recognizes [`Interrupted`], [`LockError::Interrupted`] and the master
/// [`KeelError::Interrupted`] variant.
pub fn is_interruption(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        e.is::<Interrupted>()
            || matches!(e.downcast_ref::<LockError>(), Some(LockError::Interrupted { .. }))
            || matches!(e.downcast_ref::<KeelError>(), Some(KeelError::Interrupted(_)))
    })
}

// =============================================================================
// TESTS
// =============================================================================

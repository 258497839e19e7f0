//! Configuration types
//!
//! Loaded from TOML, overridable from `KEEL_*` environment variables, and
//! validated before use. Durations are expressed in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ConfigError;

/// Retry configuration shared by one category of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total invocation attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1001,
            backoff_multiplier: 1.5,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be >= 1".to_string(),
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier",
                reason: format!("must be a finite number >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff_ms",
                reason: "must be >= initial_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub threads: usize,
    pub thread_name_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name_prefix: "keel-worker-".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.threads",
                reason: "must be > 0".to_string(),
            });
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "worker.thread_name_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Keyed lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How often a blocked interruptible acquisition re-checks for interruption
    pub interrupt_poll_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { interrupt_poll_ms: 10 }
    }
}

impl LockConfig {
    pub fn interrupt_poll(&self) -> Duration {
        Duration::from_millis(self.interrupt_poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interrupt_poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock.interrupt_poll_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KeelConfig {
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub lock: LockConfig,
}

impl KeelConfig {
    /// Load from a TOML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields from environment variables.
    ///
    /// Environment variables:
    /// - `KEEL_RETRY_MAX_ATTEMPTS`
    /// - `KEEL_RETRY_INITIAL_BACKOFF_MS`
    /// - `KEEL_RETRY_BACKOFF_MULTIPLIER`
    /// - `KEEL_RETRY_MAX_BACKOFF_MS`
    /// - `KEEL_WORKER_THREADS`
    /// - `KEEL_WORKER_THREAD_PREFIX`
    /// - `KEEL_LOCK_INTERRUPT_POLL_MS`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary key lookup (same keys as [`Self::apply_env`]).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KEEL_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("retry.max_attempts", &v)?;
        }
        if let Some(v) = lookup("KEEL_RETRY_INITIAL_BACKOFF_MS") {
            self.retry.initial_backoff_ms = parse_env("retry.initial_backoff_ms", &v)?;
        }
        if let Some(v) = lookup("KEEL_RETRY_BACKOFF_MULTIPLIER") {
            self.retry.backoff_multiplier = parse_env("retry.backoff_multiplier", &v)?;
        }
        if let Some(v) = lookup("KEEL_RETRY_MAX_BACKOFF_MS") {
            self.retry.max_backoff_ms = parse_env("retry.max_backoff_ms", &v)?;
        }
        if let Some(v) = lookup("KEEL_WORKER_THREADS") {
            self.worker.threads = parse_env("worker.threads", &v)?;
        }
        if let Some(v) = lookup("KEEL_WORKER_THREAD_PREFIX") {
            self.worker.thread_name_prefix = v;
        }
        if let Some(v) = lookup("KEEL_LOCK_INTERRUPT_POLL_MS") {
            self.lock.interrupt_poll_ms = parse_env("lock.interrupt_poll_ms", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.worker.validate()?;
        self.lock.validate()?;
        Ok(())
    }
}

fn parse_env<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field,
        reason: format!("cannot parse {:?}: {}", raw, e),
    })
}

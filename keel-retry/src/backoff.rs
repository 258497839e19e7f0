//! Inter-attempt delays.

use std::time::Duration;

use keel_core::{ConfigError, RetryConfig};

/// Exponential backoff, capped.
///
/// The delay after failed attempt `n` (1-based) is
/// `initial * multiplier^(n-1)`, never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Backoff {
    /// Retry immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::exponential(config.initial_backoff(), config.backoff_multiplier, config.max_backoff())
    }

    /// Same rules as [`RetryConfig::validate`]: the multiplier is finite and
    /// at least 1.0, and `max` is not below `initial`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier",
                reason: format!("must be a finite number >= 1.0, got {}", self.multiplier),
            });
        }
        if self.max < self.initial {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff_ms",
                reason: "must be >= initial_backoff_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Delay to wait after failed attempt `attempt` before the next one.
    ///
    /// Never panics, even for a backoff that fails [`validate`](Self::validate).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        if exponent == 0 {
            return self.initial.min(self.max);
        }
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

//! KEEL Core - Shared Types
//!
//! Error taxonomy, configuration, interruption tokens and execution context
//! snapshots. Every other KEEL crate depends on this one.

use chrono::{DateTime, Utc};

pub mod config;
pub mod context;
pub mod error;
pub mod interrupt;
pub mod telemetry;

pub use config::{KeelConfig, LockConfig, RetryConfig, WorkerConfig};
pub use context::{
    correlation_fields, correlation_value, current_principal, ensure_correlation_id,
    put_correlation, remove_correlation, scoped_correlation, set_principal, ContextScope,
    CorrelationScope, ExecutionContext, Principal, CORRELATION_ID,
};
pub use error::{
    chain, is_interruption, ConfigError, Interrupted, KeelError, KeelResult, LockError, PoolError,
    TaskError,
};
pub use interrupt::{InterruptScope, InterruptToken};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

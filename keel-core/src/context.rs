//! Execution context snapshots.
//!
//! Every thread carries two pieces of ambient state: a set of correlation
//! fields (key/value pairs surfaced in logs) and an optional security
//! principal. Both live in thread-locals. An [`ExecutionContext`] captures
//! them on one thread and re-installs them on another, so a unit of work
//! handed to a pooled worker keeps logging and authorization coherent with
//! the code that spawned it.
//!
//! # State Transition Diagram
//!
//! ```text
//! parent thread:  capture() ──→ ExecutionContext ──→ moved to worker
//! worker thread:  (prior state) ── install() ──→ (snapshot state) ── drop ──→ (prior state)
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Timestamp;

/// Correlation field carrying the logical operation id.
pub const CORRELATION_ID: &str = "correlation_id";

/// Authenticated identity on whose behalf work runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User identifier (login name or API key identifier)
    pub user_id: String,
    /// Granted roles/authorities
    pub roles: Vec<String>,
    /// When the credentials were established
    pub authenticated_at: Timestamp,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
            authenticated_at: chrono::Utc::now(),
        }
    }

    /// Check if the principal has a specific role.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

thread_local! {
    static CORRELATION: RefCell<BTreeMap<String, String>> = const { RefCell::new(BTreeMap::new()) };
    static PRINCIPAL: RefCell<Option<Arc<Principal>>> = const { RefCell::new(None) };
}

// ============================================================================
// THREAD-LOCAL ACCESSORS
// ============================================================================

/// Set a correlation field on the calling thread.
pub fn put_correlation(key: impl Into<String>, value: impl Into<String>) {
    CORRELATION.with(|fields| {
        fields.borrow_mut().insert(key.into(), value.into());
    });
}

/// Read a correlation field from the calling thread.
pub fn correlation_value(key: &str) -> Option<String> {
    CORRELATION.with(|fields| fields.borrow().get(key).cloned())
}

/// Remove a correlation field from the calling thread.
pub fn remove_correlation(key: &str) -> Option<String> {
    CORRELATION.with(|fields| fields.borrow_mut().remove(key))
}

/// Copy of every correlation field on the calling thread.
pub fn correlation_fields() -> BTreeMap<String, String> {
    CORRELATION.with(|fields| fields.borrow().clone())
}

/// Set a correlation field until the returned guard drops, then restore the
/// previous value (or absence) of that key.
pub fn scoped_correlation(key: impl Into<String>, value: impl Into<String>) -> CorrelationScope {
    let key = key.into();
    let previous = CORRELATION.with(|fields| fields.borrow_mut().insert(key.clone(), value.into()));
    CorrelationScope { key, previous }
}

/// Guard returned by [`scoped_correlation`].
#[derive(Debug)]
#[must_use = "the correlation field is restored when the scope is dropped"]
pub struct CorrelationScope {
    key: String,
    previous: Option<String>,
}

impl Drop for CorrelationScope {
    fn drop(&mut self) {
        let key = std::mem::take(&mut self.key);
        let previous = self.previous.take();
        CORRELATION.with(|fields| {
            let mut fields = fields.borrow_mut();
            match previous {
                Some(value) => {
                    fields.insert(key, value);
                }
                None => {
                    fields.remove(&key);
                }
            }
        });
    }
}

/// Principal of the calling thread.
pub fn current_principal() -> Option<Arc<Principal>> {
    PRINCIPAL.with(|p| p.borrow().clone())
}

/// Replace the calling thread's principal, returning the previous one.
pub fn set_principal(principal: Option<Arc<Principal>>) -> Option<Arc<Principal>> {
    PRINCIPAL.with(|p| p.replace(principal))
}

/// Ensure the calling thread has a correlation id, generating a UUIDv7 one if
/// absent. Returns the id in effect.
pub fn ensure_correlation_id() -> String {
    CORRELATION.with(|fields| {
        fields
            .borrow_mut()
            .entry(CORRELATION_ID.to_string())
            .or_insert_with(|| Uuid::now_v7().to_string())
            .clone()
    })
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Captured correlation fields and principal of one thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    correlation: BTreeMap<String, String>,
    principal: Option<Arc<Principal>>,
}

impl ExecutionContext {
    /// Snapshot the calling thread's state.
    pub fn capture() -> Self {
        Self {
            correlation: correlation_fields(),
            principal: current_principal(),
        }
    }

    /// A snapshot with no correlation fields and no principal.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a correlation field to the snapshot.
    pub fn with_correlation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlation.insert(key.into(), value.into());
        self
    }

    /// Set the principal of the snapshot.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(Arc::new(principal));
        self
    }

    pub fn correlation(&self) -> &BTreeMap<String, String> {
        &self.correlation
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation.get(CORRELATION_ID).map(String::as_str)
    }

    pub fn principal(&self) -> Option<&Arc<Principal>> {
        self.principal.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.correlation.is_empty() && self.principal.is_none()
    }

    /// Install this snapshot on the calling thread.
    ///
    /// The thread's prior state is saved and restored when the returned
    /// scope drops, on both normal return and unwinding.
    pub fn install(&self) -> ContextScope {
        let prior_fields = CORRELATION.with(|fields| fields.replace(self.correlation.clone()));
        let prior_principal = set_principal(self.principal.clone());
        ContextScope {
            prior: Some(ExecutionContext {
                correlation: prior_fields,
                principal: prior_principal,
            }),
        }
    }

    /// A `tracing` span carrying the snapshot's correlation fields and
    /// principal, for entering around work executed under this context.
    pub fn span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "context",
            correlation = %CorrelationDisplay(&self.correlation),
            principal = tracing::field::Empty,
        );
        if let Some(principal) = &self.principal {
            span.record("principal", principal.user_id.as_str());
        }
        span
    }
}

struct CorrelationDisplay<'a>(&'a BTreeMap<String, String>);

impl fmt::Display for CorrelationDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Guard returned by [`ExecutionContext::install`].
#[derive(Debug)]
#[must_use = "the prior context is restored when the scope is dropped"]
pub struct ContextScope {
    prior: Option<ExecutionContext>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            CORRELATION.with(|fields| {
                *fields.borrow_mut() = prior.correlation;
            });
            set_principal(prior.principal);
        }
    }
}

//! Lock handles and scoped acquisitions.
//!
//! A [`LockHandle`] names a key slot; it holds no lock by itself and is cheap
//! to construct on every attempt. Acquiring produces a [`LockGuard`], which
//! releases the slot exactly once, on drop or via [`LockGuard::release`].
//!
//! # State Transition Diagram
//!
//! ```text
//! LockHandle ─── lock() / lock_interruptibly() / try_lock*() ──→ LockGuard
//!                                                                   │
//!                                             release() / drop ─────┘──→ (slot free)
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::LockError;
use serde::{Deserialize, Serialize};

use crate::manager::{LockKey, Registry, Slot, SlotKey, WaitAbort};
use crate::traits::CacheId;

// ============================================================================
// LOCK MODE ENUM
// ============================================================================

/// Requested access mode for a key slot.
///
/// Both modes are currently granted exclusively: a `Shared` acquisition
/// serializes with every other acquisition of the slot. The mode is recorded
/// so observers can tell read-only critical sections apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Read-write access
    Exclusive,
    /// Read-only access
    Shared,
}

impl LockMode {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, LockMode::Shared)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Exclusive => "Exclusive",
            LockMode::Shared => "Shared",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = LockModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exclusive" => Ok(LockMode::Exclusive),
            "shared" => Ok(LockMode::Shared),
            _ => Err(LockModeParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid lock mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockModeParseError(pub String);

impl fmt::Display for LockModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid lock mode: {}", self.0)
    }
}

impl std::error::Error for LockModeParseError {}

// ============================================================================
// LOCK HANDLE
// ============================================================================

/// Canonical handle for one `(cache, key)` slot of a lock manager.
///
/// Equality and hashing consider only the issuing manager and the slot, so
/// handles built independently at unrelated call sites compare equal and
/// serialize against each other, regardless of the requested mode and of
/// whether the cache currently holds a value for the key.
pub struct LockHandle<K: LockKey> {
    registry: Arc<Registry<K>>,
    slot: SlotKey<K>,
    cache_name: Arc<str>,
    mode: LockMode,
}

impl<K: LockKey> LockHandle<K> {
    pub(crate) fn new(registry: Arc<Registry<K>>, slot: SlotKey<K>, cache_name: Arc<str>, mode: LockMode) -> Self {
        Self {
            registry,
            slot,
            cache_name,
            mode,
        }
    }

    pub fn key(&self) -> &K {
        &self.slot.key
    }

    pub fn cache_id(&self) -> CacheId {
        self.slot.cache
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode.is_read_only()
    }

    pub(crate) fn is_from(&self, registry: &Arc<Registry<K>>) -> bool {
        Arc::ptr_eq(&self.registry, registry)
    }

    /// Block until the slot is free, then take it.
    ///
    /// Never fails and ignores interruption: callers pick this when the
    /// critical section must not be short-circuited by an unrelated
    /// shutdown.
    pub fn lock(&self) -> LockGuard<K> {
        let slot = self.registry.check_out(&self.slot);
        slot.lock();
        self.acquired(slot)
    }

    /// Block until the slot is free, aborting if the calling thread's
    /// interrupt token fires while queued.
    ///
    /// On error the slot is not held.
    pub fn lock_interruptibly(&self) -> Result<LockGuard<K>, LockError> {
        self.lock_with(None, true)
    }

    /// Take the slot only if it is free right now.
    pub fn try_lock(&self) -> Option<LockGuard<K>> {
        let slot = self.registry.check_out(&self.slot);
        if slot.try_lock() {
            Some(self.acquired(slot))
        } else {
            self.registry.check_in(&self.slot, &slot);
            None
        }
    }

    /// Wait at most `timeout` for the slot; interruptible.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<LockGuard<K>, LockError> {
        self.lock_with(Some(timeout), true)
    }

    fn lock_with(&self, timeout: Option<Duration>, interruptible: bool) -> Result<LockGuard<K>, LockError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let slot = self.registry.check_out(&self.slot);
        match slot.lock_until(deadline, interruptible, self.registry.interrupt_poll()) {
            Ok(()) => Ok(self.acquired(slot)),
            Err(abort) => {
                self.registry.check_in(&self.slot, &slot);
                let key = self.to_string();
                tracing::debug!(key = %key, abort = ?abort, "Lock wait abandoned");
                Err(match abort {
                    WaitAbort::Interrupted => LockError::Interrupted { key },
                    WaitAbort::TimedOut => LockError::TimedOut {
                        key,
                        waited: started.elapsed(),
                    },
                })
            }
        }
    }

    fn acquired(&self, slot: Arc<Slot>) -> LockGuard<K> {
        tracing::trace!(key = %self, mode = %self.mode, "Lock acquired");
        LockGuard {
            handle: self.clone(),
            slot: Some(slot),
        }
    }
}

impl<K: LockKey> Clone for LockHandle<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            slot: self.slot.clone(),
            cache_name: Arc::clone(&self.cache_name),
            mode: self.mode,
        }
    }
}

impl<K: LockKey> PartialEq for LockHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry) && self.slot == other.slot
    }
}

impl<K: LockKey> Eq for LockHandle<K> {}

impl<K: LockKey> Hash for LockHandle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl<K: LockKey> fmt::Display for LockHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.cache_name, self.slot.key)
    }
}

impl<K: LockKey> fmt::Debug for LockHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("cache", &self.cache_name)
            .field("cache_id", &self.slot.cache)
            .field("key", &self.slot.key)
            .field("mode", &self.mode)
            .finish()
    }
}

// ============================================================================
// LOCK GUARD
// ============================================================================

/// A held key slot. Released exactly once, when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<K: LockKey> {
    handle: LockHandle<K>,
    slot: Option<Arc<Slot>>,
}

impl<K: LockKey> LockGuard<K> {
    pub fn key(&self) -> &K {
        self.handle.key()
    }

    pub fn mode(&self) -> LockMode {
        self.handle.mode()
    }

    pub fn is_read_only(&self) -> bool {
        self.handle.is_read_only()
    }

    pub fn handle(&self) -> &LockHandle<K> {
        &self.handle
    }

    /// Release the slot now.
    pub fn release(self) {
        drop(self);
    }
}

impl<K: LockKey> Drop for LockGuard<K> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.unlock();
            self.handle.registry.check_in(&self.handle.slot, &slot);
            tracing::trace!(key = %self.handle, "Lock released");
        }
    }
}

impl<K: LockKey> fmt::Debug for LockGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("handle", &self.handle).finish()
    }
}

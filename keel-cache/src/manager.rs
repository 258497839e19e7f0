//! Keyed lock registry.
//!
//! Mutex state is interned per key slot `(cache identity, key)` in a
//! concurrent map. A slot exists only while some thread holds or waits for
//! it: acquisition bumps the slot's user count while the map shard is locked,
//! and the last user out removes the entry under the same shard lock. The
//! lifetime of a slot is therefore independent of whether the cache holds a
//! value for the key, and churning keys do not accumulate entries.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use keel_core::{interrupt, LockConfig};
use parking_lot::{Condvar, Mutex};

use crate::lock::{LockHandle, LockMode};
use crate::traits::{CacheId, CacheIdentity};

/// Bounds required of lock keys.
pub trait LockKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> LockKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// Identity of a key slot: which cache, which key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey<K> {
    pub cache: CacheId,
    pub key: K,
}

/// Why a bounded or interruptible wait gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitAbort {
    Interrupted,
    TimedOut,
}

#[derive(Debug, Default)]
struct SlotState {
    held: bool,
}

/// Interned mutex for one key slot.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    state: Mutex<SlotState>,
    released: Condvar,
    /// Holders plus waiters; only incremented under the registry shard lock.
    users: AtomicUsize,
}

impl Slot {
    pub(crate) fn lock(&self) {
        let mut state = self.state.lock();
        while state.held {
            self.released.wait(&mut state);
        }
        state.held = true;
    }

    pub(crate) fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.held {
            false
        } else {
            state.held = true;
            true
        }
    }

    /// Wait for the slot, giving up at `deadline` or when the calling
    /// thread's interrupt token fires (if `interruptible`).
    pub(crate) fn lock_until(
        &self,
        deadline: Option<Instant>,
        interruptible: bool,
        poll: Duration,
    ) -> Result<(), WaitAbort> {
        let token = if interruptible { interrupt::current() } else { None };
        let interrupted = || token.as_ref().is_some_and(|t| t.is_interrupted());

        if interrupted() {
            return Err(WaitAbort::Interrupted);
        }

        let mut state = self.state.lock();
        while state.held {
            if interrupted() {
                return Err(WaitAbort::Interrupted);
            }
            let now = Instant::now();
            let mut wait = if token.is_some() { poll } else { Duration::MAX };
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(WaitAbort::TimedOut);
                }
                wait = wait.min(deadline - now);
            }
            if wait == Duration::MAX {
                self.released.wait(&mut state);
            } else {
                self.released.wait_for(&mut state, wait);
            }
        }
        state.held = true;
        Ok(())
    }

    pub(crate) fn unlock(&self) {
        {
            let mut state = self.state.lock();
            state.held = false;
        }
        // Interruptible waiters may leave without taking the slot, so every
        // waiter is woken to re-check.
        self.released.notify_all();
    }

    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().held
    }
}

/// Shared state behind a [`KeyedLockManager`] and all of its handles.
#[derive(Debug)]
pub(crate) struct Registry<K: LockKey> {
    slots: DashMap<SlotKey<K>, Arc<Slot>>,
    config: LockConfig,
}

impl<K: LockKey> Registry<K> {
    /// Register the caller as a user of the slot, creating it if needed.
    pub(crate) fn check_out(&self, key: &SlotKey<K>) -> Arc<Slot> {
        let entry = self.slots.entry(key.clone()).or_default();
        entry.users.fetch_add(1, Ordering::AcqRel);
        Arc::clone(entry.value())
    }

    /// Drop the caller's use of the slot; the last user removes it.
    pub(crate) fn check_in(&self, key: &SlotKey<K>, slot: &Arc<Slot>) {
        if slot.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slots
                .remove_if(key, |_, current| Arc::ptr_eq(current, slot) && current.users.load(Ordering::Acquire) == 0);
        }
    }

    pub(crate) fn interrupt_poll(&self) -> Duration {
        self.config.interrupt_poll()
    }
}

/// Hands out lock handles scoped to `(cache, key)` slots.
///
/// A manager is an explicit value: construct one per logical lock table and
/// share it (it is cheap to clone). Handles from the same manager for the
/// same slot are equal and serialize against each other; handles from
/// different managers never interact.
///
/// # Example
///
/// ```ignore
/// let locks = KeyedLockManager::new();
/// let handle = locks.acquire(&cache, key.clone(), false);
/// let _guard = handle.lock();
/// if cache.get(&key).is_none() {
///     cache.put(key, expensive_computation());
/// }
/// ```
#[derive(Debug)]
pub struct KeyedLockManager<K: LockKey> {
    registry: Arc<Registry<K>>,
}

impl<K: LockKey> Clone for KeyedLockManager<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K: LockKey> Default for KeyedLockManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: LockKey> KeyedLockManager<K> {
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                slots: DashMap::new(),
                config,
            }),
        }
    }

    /// Get the lock handle for `key` in `cache`.
    ///
    /// `read_only` records that the caller only observes the slot; see
    /// [`LockMode`] for the current semantics.
    pub fn acquire<C>(&self, cache: &C, key: K, read_only: bool) -> LockHandle<K>
    where
        C: CacheIdentity + ?Sized,
    {
        self.handle(cache, key, LockMode::from_read_only(read_only))
    }

    /// Get the lock handle for `key` in `cache` with an explicit mode.
    pub fn handle<C>(&self, cache: &C, key: K, mode: LockMode) -> LockHandle<K>
    where
        C: CacheIdentity + ?Sized,
    {
        LockHandle::new(
            Arc::clone(&self.registry),
            SlotKey {
                cache: cache.cache_id(),
                key,
            },
            Arc::from(cache.name()),
            mode,
        )
    }

    /// Number of slots currently interned (held or waited on).
    pub fn active_slots(&self) -> usize {
        self.registry.slots.len()
    }

    /// True if some thread currently holds the slot for `key` in `cache`.
    pub fn is_locked<C>(&self, cache: &C, key: &K) -> bool
    where
        C: CacheIdentity + ?Sized,
    {
        let slot_key = SlotKey {
            cache: cache.cache_id(),
            key: key.clone(),
        };
        self.registry
            .slots
            .get(&slot_key)
            .is_some_and(|slot| slot.is_held())
    }

    /// True if `handle` was issued by this manager.
    pub fn owns(&self, handle: &LockHandle<K>) -> bool {
        handle.is_from(&self.registry)
    }
}

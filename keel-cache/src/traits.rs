//! Cache traits and cache identity.
//!
//! The keyed lock manager never reads or writes values; it only needs to
//! tell cache instances apart. That is the job of [`CacheIdentity`].
//! [`Cache`] adds the minimal value operations used by callers inside a
//! critical section.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one cache instance.
///
/// UUIDv7, assigned when the cache is constructed. Two caches with the same
/// name are still distinct key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheId(Uuid);

impl CacheId {
    /// Generate a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CacheId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instance identity of a shared cache.
pub trait CacheIdentity: Send + Sync {
    /// Stable identity of this instance.
    fn cache_id(&self) -> CacheId;

    /// Human-readable name, used in logs and lock descriptions.
    fn name(&self) -> &str;
}

/// Keyed store shared across threads.
///
/// Implementations must be thread-safe. Values may disappear at any time
/// (eviction); callers that need single-flight population pair the cache
/// with a [`KeyedLockManager`](crate::KeyedLockManager).
pub trait Cache<K, V>: CacheIdentity {
    /// Get a value from the cache.
    fn get(&self, key: &K) -> Option<V>;

    /// Put a value into the cache, replacing any previous value.
    fn put(&self, key: K, value: V);

    /// Evict the value stored under `key`.
    ///
    /// Returns true if a value was present.
    fn evict(&self, key: &K) -> bool;

    /// Get cache statistics.
    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of explicit evictions.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

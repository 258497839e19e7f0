//! KEEL Cache - Keyed Locks over Shared Caches
//!
//! A [`KeyedLockManager`] hands out lock handles that name a `(cache, key)`
//! slot rather than a cached value. Handles for the same slot are equal and
//! serialize against each other even when the value under the key is
//! evicted and repopulated between lookups.
//!
//! ```ignore
//! use keel_cache::{single_flight, InMemoryCache, KeyedLockManager};
//!
//! let cache = InMemoryCache::new("ontology");
//! let locks = KeyedLockManager::new();
//! let term = single_flight::get_or_compute(&locks, &cache, "GO:0008150", fetch_term);
//! ```

pub mod lock;
pub mod manager;
pub mod memory;
pub mod single_flight;
pub mod traits;

pub use lock::{LockGuard, LockHandle, LockMode, LockModeParseError};
pub use manager::{KeyedLockManager, LockKey, SlotKey};
pub use memory::InMemoryCache;
pub use single_flight::{get_or_compute, try_get_or_compute};
pub use traits::{Cache, CacheId, CacheIdentity, CacheStats};

//! In-memory cache backend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::traits::{Cache, CacheId, CacheIdentity, CacheStats};

/// Thread-safe `HashMap`-backed cache.
#[derive(Debug)]
pub struct InMemoryCache<K, V> {
    id: CacheId,
    name: String,
    entries: RwLock<HashMap<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Hash + Eq,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CacheId::new(),
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.evictions.fetch_add(entries.len() as u64, Ordering::Relaxed);
        entries.clear();
    }
}

impl<K, V> CacheIdentity for InMemoryCache<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn cache_id(&self) -> CacheId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<K, V> Cache<K, V> for InMemoryCache<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.read().get(key).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn put(&self, key: K, value: V) {
        self.entries.write().insert(key, value);
    }

    fn evict(&self, key: &K) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.read().len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

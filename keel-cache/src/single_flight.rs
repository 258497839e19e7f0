//! Single-flight cache population.
//!
//! Concurrent callers asking for the same missing key collapse into one
//! computation: the first to take the key slot computes and stores the value,
//! the rest wait on the slot and then observe the populated cache.

use crate::manager::{KeyedLockManager, LockKey};
use crate::traits::Cache;

/// Return the cached value for `key`, computing and storing it if absent.
///
/// `compute` runs at most once per miss across all callers sharing `locks`.
/// The slot is taken with [`LockHandle::lock`](crate::LockHandle::lock), so
/// waiting is not interruptible.
pub fn get_or_compute<K, V, C, F>(locks: &KeyedLockManager<K>, cache: &C, key: K, compute: F) -> V
where
    K: LockKey,
    V: Clone,
    C: Cache<K, V> + ?Sized,
    F: FnOnce(&K) -> V,
{
    match try_get_or_compute(locks, cache, key, |k| Ok::<V, std::convert::Infallible>(compute(k))) {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// Fallible variant of [`get_or_compute`].
///
/// A failed computation stores nothing; the next caller to take the slot
/// computes again.
pub fn try_get_or_compute<K, V, C, F, E>(
    locks: &KeyedLockManager<K>,
    cache: &C,
    key: K,
    compute: F,
) -> Result<V, E>
where
    K: LockKey,
    V: Clone,
    C: Cache<K, V> + ?Sized,
    F: FnOnce(&K) -> Result<V, E>,
{
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }

    let handle = locks.acquire(cache, key.clone(), false);
    let _guard = handle.lock();

    // Another caller may have populated the slot while we queued.
    if let Some(hit) = cache.get(&key) {
        tracing::trace!(key = %handle, "Populated while waiting");
        return Ok(hit);
    }

    let value = compute(&key)?;
    cache.put(key, value.clone());
    tracing::debug!(key = %handle, "Populated cache entry");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_hit_skips_compute() {
        let cache: InMemoryCache<&'static str, u32> = InMemoryCache::new("terms");
        let locks = KeyedLockManager::new();
        cache.put("GO", 1);
        let value = get_or_compute(&locks, &cache, "GO", |_| panic!("should not compute"));
        assert_eq!(value, 1);
        assert_eq!(locks.active_slots(), 0);
    }

    #[test]
    fn test_concurrent_misses_compute_once() {
        let cache = Arc::new(InMemoryCache::<u32, u64>::new("reports"));
        let locks = KeyedLockManager::new();
        let computed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let locks = locks.clone();
                let computed = Arc::clone(&computed);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    get_or_compute(&locks, cache.as_ref(), 7, |k| {
                        computed.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        u64::from(*k) * 100
                    })
                })
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().expect("worker"), 700);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_slots(), 0);
    }

    #[test]
    fn test_failed_compute_stores_nothing() {
        let cache: InMemoryCache<u32, u32> = InMemoryCache::new("flaky");
        let locks = KeyedLockManager::new();

        let err = try_get_or_compute(&locks, &cache, 1, |_| Err::<u32, _>("boom")).expect_err("fails");
        assert_eq!(err, "boom");
        assert!(cache.is_empty());

        let value = try_get_or_compute(&locks, &cache, 1, |_| Ok::<_, &str>(5)).expect("second try");
        assert_eq!(value, 5);
    }
}

use keel_cache::{single_flight, Cache, InMemoryCache, KeyedLockManager};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn bench_uncontended_lock(c: &mut Criterion) {
    let cache: InMemoryCache<String, u64> = InMemoryCache::new("bench");
    let locks = KeyedLockManager::new();
    let key = "GO:0008150".to_string();

    c.bench_function("lock/acquire_release", |b| {
        b.iter(|| {
            let guard = locks.acquire(&cache, black_box(key.clone()), false).lock();
            black_box(guard.key());
        });
    });
}

fn bench_single_flight_hit(c: &mut Criterion) {
    let cache: InMemoryCache<u64, u64> = InMemoryCache::new("bench");
    let locks = KeyedLockManager::new();
    cache.put(7, 49);

    c.bench_function("single_flight/hit", |b| {
        b.iter(|| {
            let value = single_flight::get_or_compute(&locks, &cache, black_box(7), |k| k * k);
            black_box(value);
        });
    });
}

fn bench_single_flight_miss(c: &mut Criterion) {
    let cache: InMemoryCache<u64, u64> = InMemoryCache::new("bench");
    let locks = KeyedLockManager::new();

    c.bench_function("single_flight/miss", |b| {
        b.iter(|| {
            let value = single_flight::get_or_compute(&locks, &cache, black_box(11), |k| k * k);
            cache.evict(&11);
            black_box(value);
        });
    });
}

criterion_group!(benches, bench_uncontended_lock, bench_single_flight_hit, bench_single_flight_miss);
criterion_main!(benches);

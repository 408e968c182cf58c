//! Benchmarks for the memory tier and the hot download path
//!
//! Target: sub-microsecond LRU touches, memory hits well under 10µs

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tiered_object_cache::cache::storage::ObjectStorageBackend;
use tiered_object_cache::cache::{CacheLayer, CacheLayerRef, MemoryCache, ShardedLruTracker};
use tiered_object_cache::{CacheOrchestrator, ObjectId};

fn bench_lru_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("lru");
    group.throughput(Throughput::Elements(1));

    let tracker = ShardedLruTracker::new();
    let ids: Vec<ObjectId> = (0..10_000).map(|i| ObjectId::new(format!("obj-{:05}", i))).collect();
    for id in &ids {
        tracker.track(id, 1024);
    }

    group.bench_function("access", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            tracker.access(black_box(&ids[counter % ids.len()]));
        });
    });

    group.finish();
}

fn bench_memory_store_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_tier");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let data = Bytes::from(vec![0xAB; size]);
        group.throughput(Throughput::Bytes(size as u64));

        let cache = MemoryCache::with_capacity(256 * 1024 * 1024);
        group.bench_with_input(BenchmarkId::new("store", size), &data, |b, data| {
            let mut counter = 0u64;
            b.to_async(&rt).iter(|| {
                counter += 1;
                let id = ObjectId::new(format!("obj-{}", counter % 128));
                let cache = &cache;
                let data = data.clone();
                async move {
                    let _ = cache.store(black_box(&id), data).await;
                }
            });
        });

        let id = ObjectId::new("hot");
        rt.block_on(cache.store(&id, data.clone())).unwrap();
        group.bench_with_input(BenchmarkId::new("get", size), &id, |b, id| {
            b.to_async(&rt).iter(|| async {
                let _ = black_box(cache.get(id).await);
            });
        });
    }

    group.finish();
}

fn bench_memory_eviction_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_tier");
    group.throughput(Throughput::Elements(1));
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Room for 64 objects; every store past that evicts
    let cache = MemoryCache::with_capacity(64 * 4096);
    let data = Bytes::from(vec![1u8; 4096]);

    group.bench_function("store_with_eviction", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let id = ObjectId::new(format!("churn-{}", counter));
            let cache = &cache;
            let data = data.clone();
            async move {
                let _ = cache.store(&id, data).await;
            }
        });
    });

    group.finish();
}

fn bench_download_memory_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("orchestrator");
    group.throughput(Throughput::Elements(1));
    let rt = tokio::runtime::Runtime::new().unwrap();

    let engine = rt.block_on(async {
        let memory: CacheLayerRef = Arc::new(MemoryCache::with_capacity(64 * 1024 * 1024));
        let (backend, _) = ObjectStorageBackend::in_memory();
        let engine = CacheOrchestrator::from_layers(vec![memory], Arc::new(backend)).unwrap();
        engine
            .store(&ObjectId::new("hot"), Bytes::from(vec![7u8; 16 * 1024]))
            .await
            .unwrap();
        engine
    });
    let id = ObjectId::new("hot");

    group.bench_function("download_memory_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let download = engine.download(black_box(&id)).await.unwrap();
            black_box(download.bytes().await.unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lru_access,
    bench_memory_store_get,
    bench_memory_eviction_churn,
    bench_download_memory_hit,
);

criterion_main!(benches);

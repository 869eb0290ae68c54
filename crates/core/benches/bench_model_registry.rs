//! Benchmark for the shared model registry's single-flight `get_or_load`.
//!
//! Measures cache-hit lookup cost and the cost of N concurrent callers
//! coalescing onto one in-flight load, which is the path the `Notify`-based
//! single-flight fix targets.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use remotemedia_core::model_registry::{ModelKey, ModelRegistry};
use std::sync::Arc;

fn bench_cache_hit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = ModelRegistry::new();
    let key = ModelKey::new("bench-model", "cpu");
    runtime.block_on(async {
        registry.get_or_load(&key, || async move { Ok((0u32, 0)) }).await.unwrap();
    });

    c.bench_function("model_registry_cache_hit", |b| {
        b.to_async(&runtime).iter(|| async {
            let handle = registry.get_or_load(black_box(&key), || async move { Ok((0u32, 0)) }).await.unwrap();
            black_box(handle)
        });
    });
}

fn bench_concurrent_single_flight(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("model_registry_single_flight");
    for waiters in [2usize, 8, 32].iter() {
        group.bench_with_input(BenchmarkId::new("waiters", waiters), waiters, |b, &waiters| {
            b.to_async(&runtime).iter(|| async move {
                let registry = Arc::new(ModelRegistry::new());
                let key = ModelKey::new("bench-contended", "cpu");

                let mut handles = Vec::with_capacity(waiters);
                for _ in 0..waiters {
                    let registry = registry.clone();
                    let key = key.clone();
                    handles.push(tokio::spawn(async move {
                        registry
                            .get_or_load(&key, || async move {
                                tokio::time::sleep(std::time::Duration::from_micros(50)).await;
                                Ok((0u32, 0))
                            })
                            .await
                            .unwrap()
                    }));
                }
                for handle in handles {
                    black_box(handle.await.unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cache_hit, bench_concurrent_single_flight);
criterion_main!(benches);

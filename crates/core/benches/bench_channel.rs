//! Throughput benchmark for the shared-memory pub/sub channel layer.
//!
//! Measures publish-then-receive round trip time for varying payload sizes,
//! so a regression in the iceoryx2 framing path shows up before it reaches
//! a real pipeline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use remotemedia_core::channel::{ChannelConfig, ChannelRegistry};
use uuid::Uuid;

fn bench_publish_receive(c: &mut Criterion) {
    let registry = ChannelRegistry::new(ChannelConfig::default()).expect("channel registry");

    let mut group = c.benchmark_group("channel_publish_receive");

    for payload_size in [64usize, 1024, 16 * 1024].iter() {
        let name = format!("bench_{}", Uuid::new_v4());
        let publisher = registry.publisher(&name).expect("publisher");
        let subscriber = registry.subscriber(&name).expect("subscriber");
        let payload = vec![0xABu8; *payload_size];

        group.bench_with_input(BenchmarkId::new("bytes", payload_size), payload_size, |b, _| {
            b.iter(|| {
                publisher.publish(black_box(&payload)).expect("publish");
                let received = subscriber.try_receive().expect("receive");
                black_box(received)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish_receive);
criterion_main!(benches);

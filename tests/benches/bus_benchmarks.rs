//! # Integration Bus Benchmarks
//!
//! | Path | What is measured |
//! |------|------------------|
//! | serializer | Encode/decode per naming policy |
//! | publish | Serialize + channel + declare + publish on the in-memory broker |

use std::time::Duration;

use bus_tests::fixtures::OrderShipped;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shared_bus::{EventBus, EventBusConfig, InMemoryBroker};
use shared_types::{EventSerializer, NamingPolicy, SerializerOptions};

// ============================================================================
// Serializer
// ============================================================================

fn bench_serializer(c: &mut Criterion) {
    let mut group = c.benchmark_group("serializer");
    let event = OrderShipped::new(42, "Überland Fracht");

    for naming in [NamingPolicy::AsIs, NamingPolicy::CamelCase, NamingPolicy::PascalCase] {
        let serializer = EventSerializer::new(SerializerOptions {
            naming,
            ..SerializerOptions::default()
        });
        let payload = serializer.serialize(&event).unwrap_or_default();

        group.bench_with_input(
            BenchmarkId::new("encode", format!("{naming:?}")),
            &event,
            |b, event| b.iter(|| black_box(serializer.serialize(event))),
        );
        group.bench_with_input(
            BenchmarkId::new("decode", format!("{naming:?}")),
            &payload,
            |b, payload| b.iter(|| black_box(serializer.deserialize::<OrderShipped>(payload))),
        );
    }
    group.finish();
}

// ============================================================================
// Publish
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => panic!("benchmark runtime: {e}"),
    };
    let broker = InMemoryBroker::new();
    let bus = EventBus::builder(broker.connection(), EventBusConfig::for_client("bench")).build();

    let mut group = c.benchmark_group("publish");
    group.measurement_time(Duration::from_secs(5));
    group.throughput(Throughput::Elements(1));
    group.bench_function("in_memory", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(bus.publish(&OrderShipped::new(7, "dhl")).await) })
    });
    group.finish();
}

criterion_group!(benches, bench_serializer, bench_publish);
criterion_main!(benches);

//! # Quadro Bridge Benchmarks
//!
//! | Path | Measures |
//! |------|----------|
//! | `call/round_trip` | Blocking call through the dispatch thread and back |
//! | `call/eight_args` | Same, with a full argument list |
//! | `signals/fan_out` | One inbound signal delivered to N observers |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quadro_bus::{BridgeConfig, BusBridges};
use quadro_tests::fixtures::{clock_tick, echo, stub_bus, sys_version};
use quadro_types::{CallArguments, Variant, MAX_CALL_ARGS};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

fn bench_call_round_trip(c: &mut Criterion) {
    let bus = stub_bus();
    let bridges = BusBridges::connect(Arc::new(bus), BridgeConfig::default());
    let session = bridges.session();

    let mut group = c.benchmark_group("call");
    group.measurement_time(Duration::from_secs(5));

    let no_args = CallArguments::new();
    group.bench_function("round_trip", |b| {
        b.iter(|| black_box(session.call(&sys_version(), &no_args)))
    });

    let mut rng = rand::thread_rng();
    let full = CallArguments::from_values((0..MAX_CALL_ARGS).map(|_| rng.gen::<i64>()))
        .unwrap_or_default();
    group.bench_function("eight_args", |b| {
        b.iter(|| black_box(session.call(&echo(), &full)))
    });

    group.finish();
}

fn bench_signal_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("signals");

    for observers in [1usize, 8, 64] {
        let bus = stub_bus();
        let bridges = BusBridges::connect(Arc::new(bus.clone()), BridgeConfig::default());
        let session = bridges.session();
        for i in 0..observers {
            let _ = session.attach(&clock_tick(), &format!("ui-{i}"));
        }
        let mut notifications = session.notifications();

        group.throughput(Throughput::Elements(observers as u64));
        group.bench_with_input(
            BenchmarkId::new("fan_out", observers),
            &observers,
            |b, &observers| {
                b.iter(|| {
                    bus.emit_from(&clock_tick(), vec![Variant::Int(42)]);
                    for _ in 0..observers {
                        black_box(notifications.blocking_recv());
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_call_round_trip, bench_signal_fan_out);
criterion_main!(benches);

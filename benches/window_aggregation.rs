//! Sliding window benchmark
//!
//! Record is the hot path (every completed outer call); read and snapshot
//! run once per report on the reporter thread.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench window_aggregation
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use modperf::attribution::{AttributionReader, ShortNames};
use modperf::clock::ManualClock;
use modperf::module::ModuleId;
use modperf::{MonitorConfig, SlidingWindowAggregator};
use std::sync::Arc;
use std::time::Duration;

fn bench_record(c: &mut Criterion) {
    let agg = SlidingWindowAggregator::new(Duration::from_secs(10));
    let module = ModuleId::in_memory("bench");
    let mut ts = 0u64;

    c.bench_function("window_record", |b| {
        b.iter(|| {
            agg.record(
                black_box(&module),
                Duration::from_micros(ts),
                Duration::from_micros(50),
            );
            ts += 1;
        });
    });
}

/// Read after a burst of records, most of which have expired
fn bench_read_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_read_evict");

    for entries in [100u64, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(entries),
            &entries,
            |b, &entries| {
                let module = ModuleId::in_memory("bench");
                b.iter_batched(
                    || {
                        let agg = SlidingWindowAggregator::new(Duration::from_secs(10));
                        for i in 0..entries {
                            agg.record(&module, Duration::from_millis(i), Duration::from_micros(10));
                        }
                        agg
                    },
                    |agg| black_box(agg.read(&module, Duration::from_millis(entries + 9_990))),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let config = MonitorConfig::default();

    for modules in [10usize, 100] {
        let agg = Arc::new(SlidingWindowAggregator::new(config.window()));
        for m in 0..modules {
            let id = ModuleId::in_memory(format!("mod{}", m));
            for i in 0..50u64 {
                agg.record(&id, Duration::from_millis(i * 100), Duration::from_micros(m as u64 + i));
            }
        }
        let reader = AttributionReader::new(
            Arc::clone(&agg),
            Arc::new(ManualClock::new()),
            Arc::new(ShortNames),
            &config,
        );

        group.bench_with_input(BenchmarkId::from_parameter(modules), &modules, |b, _| {
            b.iter(|| black_box(reader.snapshot_at(Duration::from_secs(5))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record, bench_read_with_eviction, bench_snapshot);
criterion_main!(benches);

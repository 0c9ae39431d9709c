use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pulse_engine::stats::RunningStat;
use pulse_engine::MetricCollector;

fn record_load_benchmark(c: &mut Criterion) {
    let collector = MetricCollector::with_defaults();
    let mut value = 0.0_f64;

    c.bench_function("collector_record_load", |b| {
        b.iter(|| {
            value = (value + 37.0) % 2500.0;
            collector.record_load(black_box("home"), black_box(value));
        })
    });
}

fn record_call_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("collector_record_call");

    for endpoints in [1usize, 16, 256] {
        let collector = MetricCollector::with_defaults();
        let keys: Vec<String> = (0..endpoints).map(|i| format!("/api/v1/resource/{i}")).collect();
        let mut i = 0usize;

        group.bench_with_input(BenchmarkId::from_parameter(endpoints), &keys, |b, keys| {
            b.iter(|| {
                i = i.wrapping_add(1);
                let status = if i % 50 == 0 { 500 } else { 200 };
                collector.record_call(black_box(&keys[i % keys.len()]), 120.0, Some(status));
            })
        });
    }
    group.finish();
}

fn running_stat_benchmark(c: &mut Criterion) {
    c.bench_function("running_stat_push_p95", |b| {
        let mut stat = RunningStat::with_window(100);
        let mut value = 0.0_f64;
        b.iter(|| {
            value = (value + 13.0) % 1000.0;
            stat.record(value);
            black_box(stat.percentile(0.95))
        })
    });
}

criterion_group!(
    benches,
    record_load_benchmark,
    record_call_benchmark,
    running_stat_benchmark
);
criterion_main!(benches);

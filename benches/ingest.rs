//! Insert and select throughput benchmarks.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use tidemark::{DataPoint, Label, Row, StorageBuilder, TimestampPrecision};

fn bench_insert_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_rows");

    for batch_size in [1usize, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let storage = StorageBuilder::new()
                    .with_timestamp_precision(TimestampPrecision::Seconds)
                    .build()
                    .unwrap();

                let rows: Vec<Row> = (0..batch_size)
                    .map(|i| {
                        Row::new(
                            "bench_metric",
                            DataPoint::new(1_600_000_000 + i as i64, i as f64),
                        )
                    })
                    .collect();

                b.iter(|| {
                    storage.insert_rows(black_box(&rows)).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_insert_labeled_rows(c: &mut Criterion) {
    c.bench_function("insert_rows_labeled", |b| {
        let storage = StorageBuilder::new()
            .with_timestamp_precision(TimestampPrecision::Seconds)
            .build()
            .unwrap();

        let rows: Vec<Row> = (0..100)
            .map(|i| {
                Row::with_labels(
                    "bench_metric",
                    vec![
                        Label::new("host", format!("host-{}", i % 8)),
                        Label::new("region", "us-east-1"),
                    ],
                    DataPoint::new(1_600_000_000 + i as i64, i as f64),
                )
            })
            .collect();

        b.iter(|| {
            storage.insert_rows(black_box(&rows)).unwrap();
        });
    });
}

fn bench_select(c: &mut Criterion) {
    let storage = StorageBuilder::new()
        .with_timestamp_precision(TimestampPrecision::Seconds)
        .with_partition_duration(Duration::from_secs(100_000))
        .build()
        .unwrap();

    let rows: Vec<Row> = (0..10_000)
        .map(|i| Row::new("bench_metric", DataPoint::new(1_600_000_000 + i, i as f64)))
        .collect();
    storage.insert_rows(&rows).unwrap();

    let mut group = c.benchmark_group("select");
    for window in [100i64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(window), &window, |b, &window| {
            b.iter(|| {
                let points = storage
                    .select(
                        black_box("bench_metric"),
                        &[],
                        1_600_000_000,
                        1_600_000_000 + window,
                    )
                    .unwrap();
                black_box(points);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_insert_rows,
    bench_insert_labeled_rows,
    bench_select
);
criterion_main!(benches);

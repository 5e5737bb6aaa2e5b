use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iofs_metrics::{Metrics, OpKind};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn bench_record(c: &mut Criterion) {
    let metrics = Metrics::new();
    c.bench_function("record", |b| {
        b.iter(|| metrics.record(black_box(OpKind::Read), Duration::from_nanos(250), 4096));
    });

    c.bench_function("timer_drop", |b| {
        b.iter(|| {
            let mut timer = metrics.timer_with_units(OpKind::Write, 0);
            timer.set_units(black_box(4096));
        });
    });
}

fn bench_record_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_contended");

    for threads in [2, 4, 8] {
        const PER_THREAD: u64 = 1_000;
        group.throughput(Throughput::Elements(threads as u64 * PER_THREAD));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let metrics = Arc::new(Metrics::new());
            b.iter(|| {
                let workers: Vec<_> = (0..threads)
                    .map(|_| {
                        let metrics = Arc::clone(&metrics);
                        thread::spawn(move || {
                            for _ in 0..PER_THREAD {
                                metrics.record(OpKind::Getattr, Duration::from_nanos(100), 1);
                            }
                        })
                    })
                    .collect();
                for w in workers {
                    let _ = w.join();
                }
            });
        });
    }
    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let metrics = Metrics::new();
    for kind in OpKind::ALL {
        metrics.record(kind, Duration::from_micros(3), 17);
    }
    c.bench_function("render_all_kinds", |b| b.iter(|| black_box(metrics.render())));
}

criterion_group!(benches, bench_record, bench_record_contended, bench_render);
criterion_main!(benches);

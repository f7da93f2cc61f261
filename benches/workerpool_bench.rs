// WorkerPool throughput under varying pool sizes and task counts: measures
// how much of the rendezvous-channel backpressure shows up as wall-clock
// cost for cheap, CPU-bound tasks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use objectfs::workerpool::{TaskGroup, WorkerPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_submit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("workerpool_submit_throughput");

    for pool_size in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("tasks_1000", pool_size),
            &pool_size,
            |b, &pool_size| {
                let pool = WorkerPool::new(pool_size);
                b.iter(|| {
                    let group = TaskGroup::new();
                    let counter = Arc::new(AtomicU64::new(0));
                    for _ in 0..1000 {
                        let counter = counter.clone();
                        pool.submit(&group, move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                    group.wait();
                    black_box(counter.load(Ordering::Relaxed))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_submit_throughput);
criterion_main!(benches);

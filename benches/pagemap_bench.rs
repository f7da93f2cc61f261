// PageMap benchmarks: coalescing throughput under sequential and random
// write patterns, and the cost of computing unloaded ranges on a
// fragmented map.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use objectfs::pagemap::PageMap;

const MIB: u64 = 1024 * 1024;

fn bench_sequential_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("pagemap_sequential_writes");

    for page_count in [16usize, 256, 4096] {
        group.bench_with_input(
            BenchmarkId::new("mark_modified", page_count),
            &page_count,
            |b, &page_count| {
                b.iter(|| {
                    let mut pm = PageMap::new(page_count as u64 * MIB);
                    for i in 0..page_count as u64 {
                        pm.mark_modified(black_box((i * MIB, MIB)));
                    }
                    black_box(pm.pages().len())
                });
            },
        );
    }
    group.finish();
}

fn bench_fragmented_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("pagemap_fragmented_writes");

    group.bench_function("interleaved_4k_writes", |b| {
        b.iter(|| {
            let mut pm = PageMap::new(64 * MIB);
            let mut offset = 0u64;
            while offset < 64 * MIB {
                pm.mark_modified(black_box((offset, 4096)));
                offset += 8192;
            }
            black_box(pm.modified_ranges().len())
        });
    });
    group.finish();
}

fn bench_unloaded_ranges_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("pagemap_unloaded_ranges");

    group.bench_function("half_loaded_100mib_file", |b| {
        let mut pm = PageMap::new(100 * MIB);
        for i in 0..50 {
            pm.mark_loaded((i * 2 * MIB, MIB));
        }
        b.iter(|| black_box(pm.unloaded_ranges((0, 100 * MIB))));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_writes,
    bench_fragmented_writes,
    bench_unloaded_ranges_lookup
);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crawl_fleet::partition::{even_partition, rotation_slice, split_round_robin};

fn bench_even_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("even_partition");

    for total_pages in [300u64, 5_000, 100_000] {
        let ids: Vec<u32> = (1..=20).collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(total_pages),
            &total_pages,
            |b, &total| {
                b.iter(|| even_partition(black_box(total), black_box(&ids)));
            },
        );
    }
    group.finish();
}

fn bench_round_robin_deal(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_deal");

    for batch in [50usize, 500, 5_000] {
        let pages: Vec<u64> = (1..=batch as u64).collect();
        group.bench_with_input(BenchmarkId::from_parameter(batch), &pages, |b, pages| {
            b.iter(|| split_round_robin(black_box(pages), black_box(8)));
        });
    }
    group.finish();
}

fn bench_rotation_walk(c: &mut Criterion) {
    c.bench_function("rotation_full_cycle", |b| {
        b.iter(|| {
            let mut last = 0u64;
            while let Some(range) = rotation_slice(black_box(last), 100_000, 50) {
                last = range.end;
            }
            last
        });
    });
}

criterion_group!(
    benches,
    bench_even_partition,
    bench_round_robin_deal,
    bench_rotation_walk
);
criterion_main!(benches);

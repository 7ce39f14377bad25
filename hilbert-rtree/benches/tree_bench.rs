//! Hilbert R-Tree benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hilbert_rtree::{Crs, Dimension, Envelope, HilbertRTree, MemoryMapper};
use std::hint::black_box;
use tempfile::tempdir;

const CRS: Crs = Crs {
    srid: 4326,
    dim: Dimension::Two,
};

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("HilbertRTree Insert");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let path = dir.path().join("bench.hrt");
                    let tree =
                        HilbertRTree::create_on_disk(&path, MemoryMapper::new(), CRS, 32, 32)
                            .unwrap();
                    (tree, dir)
                },
                |(tree, _dir)| {
                    for i in 0..size {
                        let x = (i % 100) as f64;
                        let y = (i / 100) as f64;
                        tree.add(i as u64, &Envelope::rect(x, y, x + 1.0, y + 1.0).unwrap())
                            .unwrap();
                    }
                    black_box(tree.len())
                },
            );
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("HilbertRTree Search");

    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.hrt");
    let tree = HilbertRTree::create_on_disk(&path, MemoryMapper::new(), CRS, 32, 32).unwrap();

    // Populate tree
    for i in 0..10000u64 {
        let x = (i % 100) as f64;
        let y = (i / 100) as f64;
        tree.add(i, &Envelope::rect(x, y, x + 1.0, y + 1.0).unwrap())
            .unwrap();
    }

    group.bench_function("search_10k", |b| {
        b.iter(|| {
            let query = Envelope::rect(25.0, 25.0, 75.0, 75.0).unwrap();
            black_box(tree.search_ids(&query).unwrap())
        });
    });

    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("HilbertRTree Rebuild");
    group.sample_size(10);

    group.bench_function("rebuild_10k", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("bench.hrt");
                let tree =
                    HilbertRTree::create_on_disk(&path, MemoryMapper::new(), CRS, 32, 32).unwrap();
                for i in 0..10000u64 {
                    let x = (i % 100) as f64;
                    let y = (i / 100) as f64;
                    tree.add(i, &Envelope::rect(x, y, x + 1.0, y + 1.0).unwrap())
                        .unwrap();
                }
                (tree, dir)
            },
            |(tree, _dir)| black_box(tree.rebuild().unwrap()),
        );
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_rebuild);
criterion_main!(benches);

//! Insert and scan throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stratum::{OnConflict, Tree, TreeOptions};

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_10k_sequential", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let tree: Tree =
                    TreeOptions::new().page_size(4096).open(dir.path().join("bench.db")).unwrap();
                (dir, tree)
            },
            |(_dir, tree)| {
                let mut writer = tree.writer().unwrap();
                for i in 0..10_000u64 {
                    writer
                        .insert(&i.to_be_bytes(), &i.to_le_bytes(), OnConflict::Fail)
                        .unwrap();
                }
            },
        )
    });
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let tree: Tree = TreeOptions::new().page_size(4096).open(dir.path().join("bench.db")).unwrap();
    {
        let mut writer = tree.writer().unwrap();
        for i in 0..100_000u64 {
            writer.insert(&i.to_be_bytes(), &i.to_le_bytes(), OnConflict::Fail).unwrap();
        }
    }

    c.bench_function("scan_100k", |b| {
        b.iter(|| {
            let count = tree.seek_all().unwrap().count();
            black_box(count)
        })
    });

    c.bench_function("get_point_lookup", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 7919) % 100_000;
            black_box(tree.get(&i.to_be_bytes()).unwrap())
        })
    });
}

criterion_group!(benches, bench_insert, bench_scan);
criterion_main!(benches);

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use cooldb::{BTree, Dataset, Db, Options, Predicate};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1_000_000);

fn bench_engine_suites(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = Options::new(dir.path());
    opts.initial_file_pages = 4096;
    let db = Db::open(opts).unwrap();

    let setup = db.begin().unwrap();
    let ds = Dataset::create(&db, &setup).unwrap();
    let tree = BTree::create(&db, &setup).unwrap();
    let mut rids = Vec::new();
    for i in 0..200u64 {
        let rid = ds
            .insert(&db, &setup, format!("val_{}", i).as_bytes())
            .unwrap();
        tree.insert(&db, &setup, format!("key_{:08}", i).as_bytes(), rid)
            .unwrap();
        rids.push(rid);
    }
    db.commit(&setup).unwrap();

    let mut g1 = c.benchmark_group("Basic-Operations");
    g1.measurement_time(Duration::from_secs(5));

    g1.bench_function("dataset_insert_commit", |b| {
        b.iter(|| {
            let tx = db.begin().unwrap();
            ds.insert(&db, &tx, b"bench row payload").unwrap();
            db.commit(&tx).unwrap();
        });
    });

    g1.bench_function("dataset_point_fetch", |b| {
        b.iter(|| {
            let tx = db.begin().unwrap();
            ds.fetch(&db, &tx, rids[57]).unwrap();
            db.commit(&tx).unwrap();
        });
    });

    g1.bench_function("tree_insert_commit", |b| {
        b.iter(|| {
            let i = NEXT_KEY.fetch_add(1, Ordering::SeqCst);
            let tx = db.begin().unwrap();
            tree.insert(&db, &tx, format!("key_{:012}", i).as_bytes(), rids[0])
                .unwrap();
            db.commit(&tx).unwrap();
        });
    });

    g1.bench_function("tree_point_lookup", |b| {
        b.iter(|| {
            let tx = db.begin().unwrap();
            tree.lookup(&db, &tx, b"key_00000042").unwrap();
            db.commit(&tx).unwrap();
        });
    });
    g1.finish();

    let mut g2 = c.benchmark_group("Scans");
    g2.measurement_time(Duration::from_secs(5));

    g2.bench_function("tree_range_scan", |b| {
        let pred = Predicate::Range {
            lo: Some(b"key_00000010".to_vec()),
            lo_incl: true,
            hi: Some(b"key_00000060".to_vec()),
            hi_incl: false,
        };
        b.iter(|| {
            let tx = db.begin().unwrap();
            let (mut cursor, mut item) = tree.find_first(&db, &tx, &pred, false, None).unwrap();
            while item.is_some() {
                item = tree.find_next(&db, &tx, &mut cursor, &pred, None).unwrap();
            }
            db.commit(&tx).unwrap();
        });
    });

    g2.bench_function("dataset_full_scan", |b| {
        b.iter(|| {
            let tx = db.begin().unwrap();
            let mut scan = ds.scan(&db).unwrap();
            while scan.next(&db, &tx, None).unwrap().is_some() {}
            db.commit(&tx).unwrap();
        });
    });
    g2.finish();
}

criterion_group!(benches, bench_engine_suites);
criterion_main!(benches);

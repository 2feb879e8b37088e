//! Load and query benchmarks over an on-disk store.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tarka::Store;
use tempfile::TempDir;

const XSD_INT: &str = "http://www.w3.org/2001/XMLSchema#integer";

fn populated_store(quads: u32) -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let mut batch = store.batch();
    for i in 0..quads {
        let s = store.intern(&format!("http://x/person{}", i % 1000)).unwrap();
        let p = store.intern(&format!("http://x/p{}", i % 7)).unwrap();
        let o = store
            .intern(&format!("\"{}\"^^<{}>", i, XSD_INT))
            .unwrap();
        batch.add(tarka::Quad::new(s, p, o, 0)).unwrap();
    }
    batch.commit().unwrap();
    (dir, store)
}

fn bench_bulk_insert(c: &mut Criterion) {
    c.bench_function("insert_10k_quads", |b| {
        b.iter(|| {
            let (_dir, store) = populated_store(10_000);
            black_box(store.stats().quad_count)
        });
    });
}

fn bench_pattern_scan(c: &mut Criterion) {
    let (_dir, store) = populated_store(50_000);
    let p = store.intern("http://x/p3").unwrap();

    c.bench_function("scan_by_predicate", |b| {
        b.iter(|| {
            let reader = store.reader();
            let pattern = tarka::QuadPattern {
                p: Some(p),
                g: Some(0),
                ..Default::default()
            };
            let count = reader.scan(pattern).unwrap().count();
            black_box(count)
        });
    });
}

fn bench_sparql_join(c: &mut Criterion) {
    let (_dir, store) = populated_store(50_000);

    c.bench_function("sparql_join_with_filter", |b| {
        b.iter(|| {
            let solutions = store
                .query(
                    "SELECT ?s ?v WHERE { ?s <http://x/p1> ?v . ?s <http://x/p2> ?w \
                     FILTER(?v > 1000) } LIMIT 100",
                )
                .unwrap()
                .into_solutions()
                .unwrap();
            black_box(solutions.len())
        });
    });
}

fn bench_aggregation(c: &mut Criterion) {
    let (_dir, store) = populated_store(50_000);

    c.bench_function("sparql_group_count", |b| {
        b.iter(|| {
            let solutions = store
                .query(
                    "SELECT ?s (COUNT(?v) AS ?c) WHERE { ?s <http://x/p0> ?v } GROUP BY ?s",
                )
                .unwrap()
                .into_solutions()
                .unwrap();
            black_box(solutions.len())
        });
    });
}

criterion_group!(
    benches,
    bench_bulk_insert,
    bench_pattern_scan,
    bench_sparql_join,
    bench_aggregation
);
criterion_main!(benches);

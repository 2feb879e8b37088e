//! Randomized storage check against an authoritative in-memory model.
//!
//! Generates random quad sets and patterns with a seeded RNG, mirrors every
//! insert/remove in a `HashSet`, and verifies that every pattern scan —
//! whichever index it selects — returns exactly the model's answer.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tarka::store::{Quad, QuadPattern, Store, StoreResult};
use tempfile::TempDir;

struct Model {
    quads: HashSet<Quad>,
}

impl Model {
    fn matching(&self, pattern: QuadPattern) -> HashSet<Quad> {
        self.quads
            .iter()
            .filter(|q| pattern.matches(q))
            .copied()
            .collect()
    }
}

fn vocab_atom(store: &Store, kind: &str, n: u32) -> u32 {
    store.intern(&format!("http://x/{}{}", kind, n)).unwrap()
}

#[test]
fn random_quads_match_reference_model() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    let mut model = Model {
        quads: HashSet::new(),
    };

    // Small vocabulary so patterns hit real data and duplicates occur.
    let subjects: Vec<u32> = (0..8).map(|i| vocab_atom(&store, "s", i)).collect();
    let predicates: Vec<u32> = (0..5).map(|i| vocab_atom(&store, "p", i)).collect();
    let objects: Vec<u32> = (0..10).map(|i| vocab_atom(&store, "o", i)).collect();
    let graphs: Vec<u32> = {
        let mut graphs = vec![0];
        graphs.extend((0..3).map(|i| vocab_atom(&store, "g", i)));
        graphs
    };

    let mut random_quad = |rng: &mut StdRng| -> Quad {
        Quad::new(
            subjects[rng.gen_range(0..subjects.len())],
            predicates[rng.gen_range(0..predicates.len())],
            objects[rng.gen_range(0..objects.len())],
            graphs[rng.gen_range(0..graphs.len())],
        )
    };

    // Mixed workload: mostly inserts, some removals, committed in batches.
    for _ in 0..40 {
        let mut batch = store.batch();
        for _ in 0..16 {
            let quad = random_quad(&mut rng);
            if rng.gen_bool(0.8) {
                batch.add(quad).unwrap();
                model.quads.insert(quad);
            } else {
                batch.remove(quad).unwrap();
                model.quads.remove(&quad);
            }
        }
        batch.commit().unwrap();
    }

    assert_eq!(store.stats().quad_count as usize, model.quads.len());

    // Every bound/unbound combination of (s, p, o, g); the component choice
    // drives index selection internally.
    let reader = store.reader();
    for _ in 0..400 {
        let pattern = QuadPattern {
            s: rng
                .gen_bool(0.5)
                .then(|| subjects[rng.gen_range(0..subjects.len())]),
            p: rng
                .gen_bool(0.5)
                .then(|| predicates[rng.gen_range(0..predicates.len())]),
            o: rng
                .gen_bool(0.5)
                .then(|| objects[rng.gen_range(0..objects.len())]),
            g: rng
                .gen_bool(0.7)
                .then(|| graphs[rng.gen_range(0..graphs.len())]),
        };

        let scanned: HashSet<Quad> = reader
            .scan(pattern)
            .unwrap()
            .collect::<StoreResult<HashSet<_>>>()
            .unwrap();
        let expected = model.matching(pattern);
        assert_eq!(scanned, expected, "pattern {:?} disagrees", pattern);
    }
}

#[test]
fn random_quads_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let mut model: HashSet<(String, String, String, String)> = HashSet::new();

    {
        let store = Store::open(dir.path()).unwrap();
        for _ in 0..200 {
            let s = format!("http://x/s{}", rng.gen_range(0..10));
            let p = format!("http://x/p{}", rng.gen_range(0..4));
            let o = format!("\"{}\"", rng.gen_range(0..20));
            let g = if rng.gen_bool(0.5) {
                String::new()
            } else {
                format!("http://x/g{}", rng.gen_range(0..2))
            };
            store.add(&s, &p, &o, &g).unwrap();
            model.insert((s, p, o, g));
        }
    }

    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.stats().quad_count as usize, model.len());
    let reader = store.reader();
    for (s, p, o, g) in &model {
        let quad = Quad::new(
            store.atoms().lookup(s).unwrap(),
            store.atoms().lookup(p).unwrap(),
            store.atoms().lookup(o).unwrap(),
            store.atoms().lookup(g).unwrap(),
        );
        assert!(reader.contains(&quad).unwrap());
    }
}

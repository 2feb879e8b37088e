//! Storage engine integration tests: atoms, indexes, batches, WAL replay.

use anyhow::Result;
use tarka::store::{Quad, QuadPattern, Store, StoreResult, Wal, WalEntry, WalOp};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn intern_quad(store: &Store, s: &str, p: &str, o: &str, g: &str) -> Quad {
    Quad::new(
        store.intern(s).unwrap(),
        store.intern(p).unwrap(),
        store.intern(o).unwrap(),
        store.intern(g).unwrap(),
    )
}

#[test]
fn inserted_quads_are_immediately_queryable() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();

    let mut batch = store.batch();
    for i in 0..100 {
        batch
            .add(intern_quad(
                &store,
                &format!("http://x/s{}", i),
                "http://x/p",
                &format!("\"{}\"", i),
                "",
            ))
            .unwrap();
    }
    batch.commit().unwrap();

    let reader = store.reader();
    for i in 0..100 {
        let quad = intern_quad(
            &store,
            &format!("http://x/s{}", i),
            "http://x/p",
            &format!("\"{}\"", i),
            "",
        );
        assert!(reader.contains(&quad).unwrap(), "missing quad {}", i);
    }
}

#[test]
fn insert_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();

    let quad = intern_quad(&store, "http://x/s", "http://x/p", "http://x/o", "");
    assert!(store.add_quad(quad).unwrap());
    let stats_before = store.stats();
    assert!(!store.add_quad(quad).unwrap());
    let stats_after = store.stats();
    assert_eq!(stats_before.quad_count, stats_after.quad_count);
}

#[test]
fn atom_interning_is_stable_across_sessions() {
    let dir = TempDir::new().unwrap();
    let (id, count) = {
        let store = Store::open(dir.path()).unwrap();
        let id = store.intern("http://example.org/a").unwrap();
        (id, store.stats().atom_count)
    };
    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.intern("http://example.org/a").unwrap(), id);
    assert_eq!(store.stats().atom_count, count);
    assert_eq!(store.atoms().resolve(id).unwrap(), "http://example.org/a");
}

#[test]
fn index_selection_agrees_for_every_bound_combination() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();

    store.add("a", "b", "c", "").unwrap();
    store.add("a", "b", "d", "").unwrap();
    store.add("a", "e", "c", "").unwrap();

    let a = store.atoms().lookup("a").unwrap();
    let b = store.atoms().lookup("b").unwrap();
    let c = store.atoms().lookup("c").unwrap();

    let reader = store.reader();
    let count = |pattern: QuadPattern| -> usize {
        reader
            .scan(pattern)
            .unwrap()
            .collect::<StoreResult<Vec<_>>>()
            .unwrap()
            .len()
    };

    // (?s, b, ?o), (?s, ?p, c), (a, ?p, ?o) from the storage contract.
    assert_eq!(
        count(QuadPattern {
            p: Some(b),
            g: Some(0),
            ..Default::default()
        }),
        2
    );
    assert_eq!(
        count(QuadPattern {
            o: Some(c),
            g: Some(0),
            ..Default::default()
        }),
        2
    );
    assert_eq!(
        count(QuadPattern {
            s: Some(a),
            g: Some(0),
            ..Default::default()
        }),
        3
    );
    assert_eq!(
        count(QuadPattern {
            g: Some(0),
            ..Default::default()
        }),
        3
    );
}

#[test]
fn batch_rollback_keeps_reader_state() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    store.add("s", "p", "o", "").unwrap();

    let mut batch = store.batch();
    for i in 0..10 {
        batch
            .add(intern_quad(&store, &format!("s{}", i), "p", "o", ""))
            .unwrap();
    }
    batch.rollback();

    assert_eq!(store.stats().quad_count, 1);
}

#[test]
fn wal_replays_unapplied_batches() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    {
        let store = Store::open(dir.path())?;
        store.add("http://x/a", "http://x/p", "\"applied\"", "")?;
        // Drop flushes and checkpoints.
    }

    // Simulate a commit that reached the WAL but not the indexes.
    {
        let mut wal = Wal::open(dir.path().join("store.wal"))?;
        wal.append(WalEntry::Batch {
            ops: vec![WalOp::Add {
                subject: "http://x/a".to_string(),
                predicate: "http://x/p".to_string(),
                object: "\"recovered\"".to_string(),
                graph: String::new(),
            }],
        })?;
    }

    let store = Store::open(dir.path())?;
    assert_eq!(store.stats().quad_count, 2);
    let recovered = intern_quad(&store, "http://x/a", "http://x/p", "\"recovered\"", "");
    assert!(store.reader().contains(&recovered)?);
    Ok(())
}

#[test]
fn torn_wal_tail_is_dropped_on_open() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    {
        let store = Store::open(dir.path())?;
        store.add("http://x/a", "http://x/p", "\"kept\"", "")?;
    }
    {
        let mut wal = Wal::open(dir.path().join("store.wal"))?;
        wal.append(WalEntry::Batch {
            ops: vec![WalOp::Add {
                subject: "http://x/a".to_string(),
                predicate: "http://x/p".to_string(),
                object: "\"torn\"".to_string(),
                graph: String::new(),
            }],
        })?;
    }
    // Tear the record as a crashed writer would.
    let wal_path = dir.path().join("store.wal");
    let len = std::fs::metadata(&wal_path)?.len();
    let file = std::fs::OpenOptions::new().write(true).open(&wal_path)?;
    file.set_len(len - 2)?;

    let store = Store::open(dir.path())?;
    assert_eq!(store.stats().quad_count, 1);
    Ok(())
}

#[test]
fn named_graph_enumeration() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();

    store.add("s", "p", "o", "").unwrap();
    store.add("s", "p", "o", "http://g/1").unwrap();
    store.add("s", "p", "o2", "http://g/1").unwrap();
    store.add("s", "p", "o", "http://g/2").unwrap();

    let reader = store.reader();
    let mut graphs: Vec<String> = reader
        .named_graphs()
        .unwrap()
        .into_iter()
        .map(|g| store.atoms().resolve(g).unwrap())
        .collect();
    graphs.sort();
    assert_eq!(graphs, vec!["http://g/1", "http://g/2"]);
}

#[test]
fn removal_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(dir.path()).unwrap();
        store.add("s", "p", "o1", "").unwrap();
        store.add("s", "p", "o2", "").unwrap();
        let victim = intern_quad(&store, "s", "p", "o1", "");
        store.remove_quad(victim).unwrap();
    }
    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.stats().quad_count, 1);
    let kept = intern_quad(&store, "s", "p", "o2", "");
    assert!(store.reader().contains(&kept).unwrap());
}

mod common;

use common::{config, init_tracing, random_vectors};
use ricedb::{Database, EngineConfig, EventFilter, EventKind, Metadata, Permissions};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const THREADS: u64 = 8;
const PER_THREAD: u64 = 100;

#[test]
fn parallel_writers_with_background_maintenance() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig {
        background_maintenance: true,
        memtable_flush_bytes: 8 * 1024,
        compaction_trigger: 3,
        ..config()
    };
    let db = Arc::new(Database::open_with_config(dir.path(), cfg.clone()).unwrap());
    let vectors = Arc::new(random_vectors((THREADS * PER_THREAD) as usize, 16, 21));

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let db = Arc::clone(&db);
            let vectors = Arc::clone(&vectors);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let id = t * PER_THREAD + i;
                    db.insert(id, vectors[id as usize].clone(), Metadata::new(), t)
                        .unwrap();
                    if i > 0 {
                        db.add_edge(id, id - 1, "prev", 1.0, t).unwrap();
                    }
                }
            })
        })
        .collect();
    let reader = {
        let db = Arc::clone(&db);
        let vectors = Arc::clone(&vectors);
        thread::spawn(move || {
            for q in vectors.iter().take(200) {
                let hits = db.search(q, 0, 5, None).unwrap();
                // User 0 only ever sees its own nodes.
                assert!(hits.iter().all(|h| h.id < PER_THREAD));
            }
        })
    };
    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();

    let stats = db.stats();
    assert_eq!(stats.nodes, (THREADS * PER_THREAD) as usize);
    assert_eq!(stats.edges, (THREADS * (PER_THREAD - 1)) as usize);
    assert_eq!(stats.last_sequence, THREADS * (2 * PER_THREAD - 1));

    drop(db);
    let db = Database::open_with_config(dir.path(), cfg).unwrap();
    assert_eq!(db.stats().nodes, (THREADS * PER_THREAD) as usize);
    for t in 0..THREADS {
        let first = t * PER_THREAD;
        let last = first + PER_THREAD - 1;
        assert_eq!(db.traverse(last, 64, t).unwrap().len(), 65);
        assert_eq!(db.get_node(first, t).unwrap().vector, vectors[first as usize]);
    }
}

#[test]
fn grants_on_different_nodes_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_with_config(dir.path(), config()).unwrap());
    for id in 0..16u64 {
        db.insert(id, vec![1.0, id as f32], Metadata::new(), 1).unwrap();
    }
    let handles: Vec<_> = (0..16u64)
        .map(|id| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for user in 100..150u64 {
                    db.grant(1, id, user, Permissions::READ).unwrap();
                }
                for user in (100..150u64).step_by(2) {
                    db.revoke(1, id, user).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    for id in 0..16u64 {
        for user in 100..150u64 {
            assert_eq!(db.check(id, user, ricedb::Permission::Read), user % 2 == 1);
        }
    }
}

#[test]
fn subscribers_see_each_committed_insert_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_with_config(dir.path(), config()).unwrap());
    let sub = db.subscribe(7, EventFilter::All);
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..25u64 {
                    db.insert(t * 25 + i, vec![1.0, i as f32], Metadata::new(), 7)
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let mut seen: Vec<u64> = sub
        .drain()
        .into_iter()
        .filter(|e| e.kind == EventKind::NodeInserted)
        .filter_map(|e| e.node)
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());

    drop(sub);
    db.insert(1_000, vec![1.0, 0.0], Metadata::new(), 7).unwrap();
    assert_eq!(db.stats().subscribers, 0);
}

#[test]
fn node_subscription_follows_one_node() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_with_config(dir.path(), config()).unwrap();
    let sub = db.subscribe(1, EventFilter::Node(2));
    db.insert(1, vec![1.0, 0.0], Metadata::new(), 1).unwrap();
    db.insert(2, vec![0.0, 1.0], Metadata::new(), 1).unwrap();
    db.add_edge(1, 2, "mentions", 0.5, 1).unwrap();
    db.delete(2, 1).unwrap();

    let kinds: Vec<EventKind> = std::iter::from_fn(|| sub.recv_timeout(Duration::from_millis(50)))
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::NodeInserted,
            EventKind::EdgeAdded {
                to: 2,
                relation: "mentions".into()
            },
            EventKind::NodeDeleted,
        ]
    );
}

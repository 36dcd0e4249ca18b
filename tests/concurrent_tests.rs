// Concurrent Tests for tabletdb
// These tests run writers, scanners and serialization from several
// threads against one server

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tabletdb::packed::pack_cells;
use tabletdb::{Cell, CompressionType, Options, ScanMode, ScanPredicate, TabletServer};
use tempfile::TempDir;

const NUM_THREADS: usize = 4;
const WRITES_PER_THREAD: usize = 100;

fn options() -> Options {
    Options::new()
        .compression(CompressionType::None)
        .abort_on_log_failure(false)
        .background_compaction(false)
}

fn count_cells(server: &TabletServer, table: &str) -> usize {
    server.scan(table, ScanPredicate::new(), ScanMode::AnyTxn).unwrap().map(|c| c.unwrap()).count()
}

#[test]
fn test_concurrent_applies() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    let server = Arc::new(TabletServer::open_dir(dir.path(), options()).unwrap());
    server.create_table_with_splits("t", &["t2".into()]).unwrap();
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let server = Arc::clone(&server);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut txns = Vec::with_capacity(WRITES_PER_THREAD);
                for i in 0..WRITES_PER_THREAD {
                    let cell = Cell::new(format!("t{}-{:04}", t, i), "c", 1, format!("{}", i));
                    txns.push(server.apply("t", pack_cells(&[cell]), i64::MAX, false).unwrap());
                }
                txns
            })
        })
        .collect();

    let mut txns = HashSet::new();
    for handle in handles {
        for txn in handle.join().unwrap() {
            assert!(txns.insert(txn), "transaction {} assigned twice", txn);
        }
    }
    let total = NUM_THREADS * WRITES_PER_THREAD;
    assert_eq!(txns.len(), total);
    assert_eq!(server.last_commit(), total as i64);

    let (durable, _) = server.sync(i64::MAX).unwrap();
    assert_eq!(durable, total as i64);
    assert_eq!(count_cells(&server, "t"), total);
}

#[test]
fn test_scans_during_writes() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    let server = Arc::new(TabletServer::open_dir(dir.path(), options()).unwrap());
    server.create_table("t").unwrap();

    let writer = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            for i in 0..200 {
                let cell = Cell::new(format!("r{:04}", i), "c", 1, "v");
                server.apply("t", pack_cells(&[cell]), i64::MAX, true).unwrap();
                if i % 50 == 49 {
                    server.serialize_now().unwrap();
                }
            }
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let mut last_seen = 0;
                for _ in 0..50 {
                    let rows: Vec<_> = server
                        .scan("t", ScanPredicate::new(), ScanMode::AnyTxn)
                        .unwrap()
                        .map(|c| c.unwrap().row().clone())
                        .collect();
                    assert!(rows.windows(2).all(|w| w[0] < w[1]), "scan out of order");
                    // Everything durable stays visible.
                    assert!(rows.len() >= last_seen);
                    last_seen = rows.len();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(count_cells(&server, "t"), 200);
}

#[test]
fn test_concurrent_serialize_now() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    let server = Arc::new(TabletServer::open_dir(dir.path(), options()).unwrap());
    server.create_table("a").unwrap();
    server.create_table("b").unwrap();
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let server = Arc::clone(&server);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let table = if t % 2 == 0 { "a" } else { "b" };
                for i in 0..20 {
                    let cell = Cell::new(format!("t{}-{:02}", t, i), "c", 1, "v");
                    server.apply(table, pack_cells(&[cell]), i64::MAX, false).unwrap();
                    if i % 5 == 4 {
                        server.serialize_now().unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    server.serialize_now().unwrap();
    assert_eq!(server.last_stable(), server.last_commit());
    assert_eq!(count_cells(&server, "a"), 40);
    assert_eq!(count_cells(&server, "b"), 40);

    server.compact_now().unwrap();
    assert_eq!(server.fragment_count(), 2);
    assert_eq!(count_cells(&server, "a"), 40);
}

#[test]
fn test_conflicting_writers() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(TabletServer::open_dir(dir.path(), options()).unwrap());
    server.create_table("t").unwrap();
    let base = server.apply("t", pack_cells(&[Cell::new("row", "c", 1, "base")]), i64::MAX, true).unwrap();
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    // Every writer read the row at `base`; only one may commit on top of it.
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let server = Arc::clone(&server);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let cell = Cell::new("row", "c", 1, format!("writer{}", t));
                server.apply("t", pack_cells(&[cell]), base, true)
            })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => committed += 1,
            Err(e) => assert!(e.is_transaction_conflict()),
        }
    }
    assert_eq!(committed, 1);
}

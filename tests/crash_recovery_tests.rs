// Crash Recovery Tests for tabletdb
// These tests verify that a reopened server replays its commit logs,
// survives torn logs and lost fragment files, and skips logs it already
// serialized

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tabletdb::packed::pack_cells;
use tabletdb::{Cell, CompressionType, Options, ScanMode, ScanPredicate, TabletServer};
use tempfile::TempDir;

fn options() -> Options {
    Options::new()
        .compression(CompressionType::None)
        .abort_on_log_failure(false)
        .background_compaction(false)
}

fn scan_all(server: &TabletServer, table: &str) -> Vec<String> {
    server
        .scan(table, ScanPredicate::new(), ScanMode::AnyTxn)
        .unwrap()
        .map(|c| c.unwrap().to_string())
        .collect()
}

fn put(server: &TabletServer, table: &str, cells: &[Cell]) -> i64 {
    server.apply(table, pack_cells(cells), i64::MAX, true).unwrap()
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
    files.sort();
    files
}

#[test]
fn test_reopen_replays_unserialized_mutations() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    {
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table("t").unwrap();
        put(&server, "t", &[Cell::new("a", "c", 1, "1")]);
        put(&server, "t", &[Cell::new("b", "c", 1, "2"), Cell::erasure("z", "c", 1)]);
        assert_eq!(server.fragment_count(), 0);
    }

    let server = TabletServer::open_dir(dir.path(), options()).unwrap();
    assert_eq!(server.table_names(), vec!["t"]);
    assert_eq!(scan_all(&server, "t"), vec!["(a,c,1,1)", "(b,c,1,2)"]);

    // Transactions restart after recovery.
    assert_eq!(server.last_commit(), 0);
    assert_eq!(put(&server, "t", &[Cell::new("c", "c", 1, "3")]), 1);

    // Recovered mutations are serialized and their logs released.
    server.serialize_now().unwrap();
    assert!(server.fragment_count() >= 1);
    assert_eq!(files_in(&dir.path().join("logs")).len(), 1);
}

#[test]
fn test_torn_log_tail() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    {
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table("t").unwrap();
        put(&server, "t", &[Cell::new("a", "c", 1, "1")]);
        put(&server, "t", &[Cell::new("b", "c", 1, "2")]);
    }
    let logs = files_in(&dir.path().join("logs"));
    assert_eq!(logs.len(), 1);
    let len = std::fs::metadata(&logs[0]).unwrap().len();
    OpenOptions::new().write(true).open(&logs[0]).unwrap().set_len(len - 1).unwrap();

    let server = TabletServer::open_dir(dir.path(), options()).unwrap();
    assert_eq!(scan_all(&server, "t"), vec!["(a,c,1,1)"]);
}

#[test]
fn test_missing_fragment_becomes_placeholder() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    {
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table("t").unwrap();
        put(&server, "t", &[Cell::new("a", "c", 1, "1")]);
        server.serialize_now().unwrap();
        put(&server, "t", &[Cell::new("b", "c", 1, "2")]);
        server.serialize_now().unwrap();
    }
    let data = files_in(&dir.path().join("data"));
    assert_eq!(data.len(), 2);
    std::fs::remove_file(&data[0]).unwrap();

    let server = TabletServer::open_dir(dir.path(), options()).unwrap();
    assert_eq!(server.fragment_count(), 2);
    assert_eq!(scan_all(&server, "t"), vec!["(b,c,1,2)"]);

    // The placeholder compacts away like any other fragment.
    server.compact_now().unwrap();
    assert_eq!(server.fragment_count(), 1);
    assert_eq!(scan_all(&server, "t"), vec!["(b,c,1,2)"]);
}

#[test]
fn test_serialized_logs_are_not_replayed() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    let saved = dir.path().join("saved.log");
    let stale;
    {
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table("t").unwrap();
        put(&server, "t", &[Cell::new("a", "c", 1, "1")]);
        let logs = files_in(&dir.path().join("logs"));
        assert_eq!(logs.len(), 1);
        stale = logs[0].clone();
        std::fs::copy(&stale, &saved).unwrap();

        server.serialize_now().unwrap();
        assert!(!stale.exists());
    }

    // Put the serialized log back as if its deletion had been lost.
    std::fs::rename(&saved, &stale).unwrap();
    let server = TabletServer::open_dir(dir.path(), options()).unwrap();
    assert_eq!(scan_all(&server, "t"), vec!["(a,c,1,1)"]);
    server.serialize_now().unwrap();
    assert_eq!(server.fragment_count(), 1);
    assert!(!stale.exists());
}

#[test]
fn test_multiple_reopen_cycles() {
    env_logger::try_init().ok();

    let dir = TempDir::new().unwrap();
    for round in 0..5 {
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        if round == 0 {
            server.create_table("t").unwrap();
        }
        put(&server, "t", &[Cell::new(format!("row{}", round), "c", 1, format!("{}", round))]);
        if round % 2 == 1 {
            server.serialize_now().unwrap();
        }
        assert_eq!(scan_all(&server, "t").len(), round + 1);
    }

    let server = TabletServer::open_dir(dir.path(), options()).unwrap();
    let expected: Vec<String> = (0..5).map(|i| format!("(row{},c,1,{})", i, i)).collect();
    assert_eq!(scan_all(&server, "t"), expected);
}

#[test]
fn test_split_table_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table_with_splits("t", &["g".into(), "q".into()]).unwrap();
        put(&server, "t", &[Cell::new("a", "c", 1, "1"), Cell::new("h", "c", 1, "2"), Cell::new("x", "c", 1, "3")]);
        server.serialize_now().unwrap();
    }
    let server = TabletServer::open_dir(dir.path(), options()).unwrap();
    let state = server.table("t").unwrap().state();
    assert_eq!(state.tablets.len(), 3);
    assert!(state.tablets.iter().all(|t| t.fragments.len() == 1));
    assert_eq!(scan_all(&server, "t"), vec!["(a,c,1,1)", "(h,c,1,2)", "(x,c,1,3)"]);
}

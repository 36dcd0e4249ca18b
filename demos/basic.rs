//! Basic usage example for tabletdb
//!
//! This example demonstrates the fundamental operations:
//! - Opening a tablet server
//! - Creating a table split into tablets
//! - Applying mutations and erasures
//! - Scanning with a predicate
//! - Serializing and compacting

use tabletdb::packed::pack_cells;
use tabletdb::{Cell, Options, ScanMode, ScanPredicate, TabletServer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    // Configure server options
    let options = Options::default()
        .commit_buffer_size(64 * 1024)
        .background_compaction(true);

    // Open the server (will be created if it doesn't exist)
    let server = TabletServer::open_dir("./example_data", options)?;
    println!("Server opened with tables {:?}", server.table_names());

    if server.table("pages").is_err() {
        server.create_table_with_splits("pages", &["com.m".into()])?;
    }

    // Write some cells
    println!("Writing data...");
    let cells = vec![
        Cell::new("com.example/", "anchor:home", 2, "Example"),
        Cell::new("com.example/", "anchor:home", 1, "Old example"),
        Cell::new("com.example/", "contents:", 1, "<html>...</html>"),
        Cell::new("com.rust-lang/", "anchor:learn", 1, "Rust"),
    ];
    let txn = server.apply("pages", pack_cells(&cells), i64::MAX, true)?;
    println!("Committed transaction {}", txn);

    // Erase a cell
    server.apply("pages", pack_cells(&[Cell::erasure("com.example/", "contents:", 1)]), i64::MAX, true)?;

    // Scan anchors only
    println!("Scanning anchors...");
    let pred = ScanPredicate::parse("column ~= 'anchor:'")?;
    for cell in server.scan("pages", pred, ScanMode::LatestRowTxn)? {
        println!("  {}", cell?);
    }

    // Push everything to disk and merge the fragments
    server.serialize_now()?;
    let runs = server.compact_now()?;
    println!("Compaction runs: {}, fragments in use: {}", runs.len(), server.fragment_count());

    let (durable, stable) = server.sync(i64::MAX)?;
    println!("Durable through {}, stable through {}", durable, stable);

    server.shutdown()?;
    println!("Server closed");

    Ok(())
}

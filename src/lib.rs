//! # tabletdb - A Tablet Storage Engine
//!
//! tabletdb stores tables of versioned cells, `(row, column, timestamp) ->
//! value`, split by row range into tablets. It follows the BigTable design:
//! mutations go to a shared commit log and into memory tables, memory tables
//! are serialized into immutable disk fragments, and compaction merges the
//! fragment stacks of tablets back down.
//!
//! ## Architecture
//!
//! - **Packed cells**: the self-checking buffer mutations and scan results
//!   travel in
//! - **Commit log**: table-tagged entries that make mutations durable
//! - **MemoryTable**: in-memory sorted cells for recent mutations
//! - **Fragments**: immutable block files with a block index and Bloom
//!   filters, shared by every tablet whose range they cover
//! - **FragDag**: the fragment lineage of each tablet, driving compaction
//! - **Scanners**: merged, reopenable reads across tablets with scan modes
//!   that detect conflicting commits
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tabletdb::packed::pack_cells;
//! use tabletdb::{Cell, Options, ScanMode, ScanPredicate, TabletServer};
//!
//! # fn main() -> Result<(), tabletdb::Error> {
//! // Open or create a server directory
//! let server = TabletServer::open_dir("./data", Options::default())?;
//! server.create_table("pages")?;
//!
//! // Mutations
//! let cells = vec![
//!     Cell::new("com.example/", "anchor:home", 1, "Example"),
//!     Cell::erasure("com.example/old", "anchor:home", 1),
//! ];
//! server.apply("pages", pack_cells(&cells), i64::MAX, true)?;
//!
//! // Scans
//! let pred = ScanPredicate::parse("row >= 'com.' and column ~= 'anchor:'")?;
//! for cell in server.scan("pages", pred, ScanMode::AnyTxn)? {
//!     println!("{}", cell?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod cell;
pub mod commitlog;
pub mod compaction;
pub mod config;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod interval;
pub mod logger;
pub mod memtable;
pub mod merge;
pub mod meta;
pub mod name;
pub mod packed;
pub mod predicate;
pub mod scanner;
pub mod server;
pub mod store;
pub mod table;
pub mod tracker;
pub mod txn;
pub mod worker;

pub use cell::{Cell, CellKey};
pub use config::{CompressionType, Options};
pub use error::{Error, Result};
pub use interval::{Interval, IntervalSet};
pub use logger::SharedLogger;
pub use memtable::{LoggedMemoryTable, MemoryTable};
pub use meta::{ConfigManager, FileConfigManager, TabletConfig};
pub use predicate::ScanPredicate;
pub use scanner::{ScanBatch, ScanMode, TableScanner};
pub use server::TabletServer;

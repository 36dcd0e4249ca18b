//! Commit log.
//!
//! The commit log makes mutations durable before they are applied to memory
//! tables. Each entry carries one table's packed cells; a log file holds
//! entries for every table sharing the logger.
//!
//! ## Recovery
//!
//! Readers treat the first malformed entry as the end of the log, so a
//! torn write at the tail after a crash loses only that entry.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tabletdb::commitlog::{CommitLogReader, CommitLogWriter};
//!
//! # fn main() -> Result<(), tabletdb::Error> {
//! let mut writer = CommitLogWriter::open("000001.log")?;
//! writer.append("table1", b"packed cells")?;
//! writer.sync()?;
//!
//! let mut reader = CommitLogReader::open("000001.log")?;
//! while let Some(entry) = reader.next_entry()? {
//!     println!("Recovered {} bytes for {}", entry.data.len(), entry.table);
//! }
//! # Ok(())
//! # }
//! ```

pub mod format;
pub mod reader;
pub mod writer;

pub use reader::{list_log_files, CommitLogReader, LogDirReader, LogEntry};
pub use writer::CommitLogWriter;

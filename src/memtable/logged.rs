//! A memory table with its own commit log.

use super::MemoryTable;
use crate::cell::Cell;
use crate::commitlog::{CommitLogReader, CommitLogWriter};
use crate::error::Result;
use crate::fragment::{CellBuffer, Fragment};
use crate::merge::FragmentMerge;
use crate::packed::pack_cells;
use crate::predicate::ScanPredicate;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOG_TABLE: &str = "memtable";

/// A [`MemoryTable`] whose every mutation is first appended to a private
/// commit log, so it can be rebuilt by reopening the log.
#[derive(Debug)]
pub struct LoggedMemoryTable {
    table: Arc<MemoryTable>,
    log: CommitLogWriter,
    path: PathBuf,
}

impl LoggedMemoryTable {
    /// Open the table at `path`, replaying any existing log.
    ///
    /// A torn entry at the end of the log is discarded before new entries
    /// are appended.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = Arc::new(MemoryTable::new(path.to_string_lossy()));
        let log = if path.exists() {
            let mut reader = CommitLogReader::open(&path)?;
            let mut entries = 0usize;
            while let Some(entry) = reader.next_entry()? {
                table.insert_all(entry.cells()?);
                entries += 1;
            }
            log::debug!("Replayed {} entries into {}", entries, path.display());
            CommitLogWriter::open_truncated(&path, reader.valid_len())?
        } else {
            CommitLogWriter::open(&path)?
        };
        Ok(Self { table, log, path })
    }

    /// Log and insert a live cell.
    pub fn set(
        &mut self,
        row: impl Into<Bytes>,
        column: impl Into<Bytes>,
        timestamp: i64,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.insert(Cell::new(row, column, timestamp, value))
    }

    /// Log and insert an erasure.
    pub fn erase(
        &mut self,
        row: impl Into<Bytes>,
        column: impl Into<Bytes>,
        timestamp: i64,
    ) -> Result<()> {
        self.insert(Cell::erasure(row, column, timestamp))
    }

    /// Log and insert a cell.
    pub fn insert(&mut self, cell: Cell) -> Result<()> {
        self.log.append(LOG_TABLE, &pack_cells([&cell]))?;
        self.table.insert(cell);
        Ok(())
    }

    /// Log and insert a batch of cells as one entry.
    pub fn insert_all(&mut self, cells: Vec<Cell>) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        self.log.append(LOG_TABLE, &pack_cells(&cells))?;
        self.table.insert_all(cells);
        Ok(())
    }

    /// Flush the log to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.log.sync()
    }

    /// Cells matching `pred` in key order, erasures included.
    pub fn scan(&self, pred: &ScanPredicate) -> Result<Vec<Cell>> {
        let chain = vec![Arc::clone(&self.table) as Arc<dyn Fragment>];
        let mut merge = FragmentMerge::new(chain, pred.clone(), false)?;
        let mut out = CellBuffer::new();
        merge.drain(&mut out)?;
        Ok(out.into_cells())
    }

    /// The in-memory table.
    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }

    /// Path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

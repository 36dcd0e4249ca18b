use super::SuperScanner;
use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::fragment::{BatchLimit, CellBuffer};
use crate::predicate::ScanPredicate;
use crate::table::Table;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default cells per batch when iterating.
pub const DEFAULT_BATCH_CELLS: usize = 1024;

/// Default bytes per batch when iterating.
pub const DEFAULT_BATCH_SIZE: usize = 1 << 20;

/// Consistency required of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// No consistency checks.
    AnyTxn = 0,
    /// Rows are delivered whole: a scan that reopens in the middle of a row
    /// fails if that row changed after the scan transaction.
    IsolatedRowTxn = 1,
    /// Every delivered row must be unchanged since the scan transaction.
    LatestRowTxn = 2,
}

impl ScanMode {
    /// Decode a mode number.
    pub fn from_i32(mode: i32) -> Result<Self> {
        match mode {
            0 => Ok(ScanMode::AnyTxn),
            1 => Ok(ScanMode::IsolatedRowTxn),
            2 => Ok(ScanMode::LatestRowTxn),
            other => Err(Error::BadScanMode(other)),
        }
    }
}

/// One batch of scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBatch {
    /// Cells in key order, erasures excluded.
    pub cells: Vec<Cell>,
    /// Transaction the scan reads at.
    pub scan_txn: i64,
    /// True when no further batches follow.
    pub end_of_scan: bool,
}

/// Client scan over a table.
#[derive(Debug)]
pub struct TableScanner {
    table: Arc<Table>,
    scanner: SuperScanner,
    mode: ScanMode,
    scan_txn: i64,
    finished: bool,
    pending: VecDeque<Cell>,
}

impl TableScanner {
    /// Scan `table` with `pred`, reading at `scan_txn`.
    pub fn new(table: Arc<Table>, pred: ScanPredicate, mode: ScanMode, scan_txn: i64) -> Result<Self> {
        if pred.max_history() != 0 {
            return Err(Error::invalid_argument("history-limited scans are not supported"));
        }
        let scanner = SuperScanner::open(Arc::clone(&table), pred, true);
        Ok(Self { table, scanner, mode, scan_txn, finished: false, pending: VecDeque::new() })
    }

    /// Transaction the scan reads at.
    pub fn scan_txn(&self) -> i64 {
        self.scan_txn
    }

    /// Consistency mode.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Fetch the next batch of at most `max_cells` cells and about
    /// `max_size` bytes. Zero means no limit.
    pub fn next_batch(&mut self, max_cells: usize, max_size: usize) -> Result<ScanBatch> {
        if self.finished {
            return Ok(ScanBatch { cells: Vec::new(), scan_txn: self.scan_txn, end_of_scan: true });
        }
        let limit = BatchLimit::new(unlimited_if_zero(max_cells), unlimited_if_zero(max_size));
        let mut out = CellBuffer::new();
        let more = match self.scanner.get(&mut out, limit) {
            Ok(more) => more,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        let cells = out.into_cells();
        if let Err(e) = self.check_conflicts(&cells) {
            self.finished = true;
            return Err(e);
        }
        self.finished = !more;
        Ok(ScanBatch { cells, scan_txn: self.scan_txn, end_of_scan: !more })
    }

    fn check_conflicts(&mut self, cells: &[Cell]) -> Result<()> {
        let reopened = self.scanner.take_reopened_rows();
        match self.mode {
            ScanMode::AnyTxn => Ok(()),
            ScanMode::IsolatedRowTxn => {
                let Some(first) = cells.first() else {
                    return Ok(());
                };
                for row in reopened {
                    if *first.row() == row && self.table.row_commit(&row) > self.scan_txn {
                        log::debug!("Scan of {} reopened mid-row on a newer commit", self.table.name());
                        return Err(Error::ScanConflict);
                    }
                }
                Ok(())
            }
            ScanMode::LatestRowTxn => {
                let mut prev: Option<&[u8]> = None;
                for cell in cells {
                    let row = cell.row().as_ref();
                    if prev == Some(row) {
                        continue;
                    }
                    prev = Some(row);
                    if self.table.row_commit(row) > self.scan_txn {
                        return Err(Error::ScanConflict);
                    }
                }
                Ok(())
            }
        }
    }
}

fn unlimited_if_zero(limit: usize) -> usize {
    if limit == 0 {
        usize::MAX
    } else {
        limit
    }
}

impl Iterator for TableScanner {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.pending.pop_front() {
                return Some(Ok(cell));
            }
            if self.finished {
                return None;
            }
            match self.next_batch(DEFAULT_BATCH_CELLS, DEFAULT_BATCH_SIZE) {
                Ok(batch) => self.pending.extend(batch.cells),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

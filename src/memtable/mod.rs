//! # MemoryTable - In-Memory Cell Buffer
//!
//! Recent mutations live in a memory table until the log group holding
//! them is serialized to a disk fragment.
//!
//! ## Design
//!
//! - Based on crossbeam-skiplist for concurrent readers during writes
//! - Erasures are stored as cells without a value
//! - Writing an existing key replaces the previous value
//! - Size is tracked to drive serialization
//! - Scans read a block copied from the range of rows they can match

mod logged;

pub use logged::LoggedMemoryTable;

use crate::cell::{Cell, CellKey, CELL_OVERHEAD};
use crate::error::{Error, Result};
use crate::fragment::{CellBlock, Fragment};
use crate::predicate::ScanPredicate;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// MemoryTable stores recent cells in key order.
///
/// As a [`Fragment`] it is a single block, copied afresh for each scan.
pub struct MemoryTable {
    uri: String,
    data: SkipMap<CellKey, Option<Bytes>>,
    size: AtomicUsize,
}

impl MemoryTable {
    /// Creates a new empty MemoryTable.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Insert a cell, replacing any cell with the same key.
    pub fn insert(&self, cell: Cell) {
        let added = cell.memory_size();
        let (key, value) = cell.into_parts();
        let replaced = self.data.get(&key).map(|e| {
            CELL_OVERHEAD
                + e.key().row().len()
                + e.key().column().len()
                + e.value().as_ref().map_or(0, |v| v.len())
        });
        self.data.insert(key, value);
        self.size.fetch_add(added, Ordering::Relaxed);
        if let Some(old) = replaced {
            self.size.fetch_sub(old, Ordering::Relaxed);
        }
    }

    /// Insert every cell of a batch.
    pub fn insert_all(&self, cells: impl IntoIterator<Item = Cell>) {
        for cell in cells {
            self.insert(cell);
        }
    }

    /// Insert a live cell.
    pub fn set(
        &self,
        row: impl Into<Bytes>,
        column: impl Into<Bytes>,
        timestamp: i64,
        value: impl Into<Bytes>,
    ) {
        self.insert(Cell::new(row, column, timestamp, value));
    }

    /// Insert an erasure.
    pub fn erase(&self, row: impl Into<Bytes>, column: impl Into<Bytes>, timestamp: i64) {
        self.insert(Cell::erasure(row, column, timestamp));
    }

    /// Look up the cell stored at `key`.
    pub fn get(&self, key: &CellKey) -> Option<Cell> {
        self.data.get(key).map(|e| Cell::from_key(e.key().clone(), e.value().clone()))
    }

    /// Number of cells, erasures included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the table holds no cells.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate memory used by the cells.
    pub fn memory_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// All cells in key order.
    pub fn cells(&self) -> Vec<Cell> {
        self.data.iter().map(|e| Cell::from_key(e.key().clone(), e.value().clone())).collect()
    }

    /// Cells whose rows lie between the lowest and the highest row `pred`
    /// admits, in key order.
    pub fn cells_for(&self, pred: &ScanPredicate) -> Vec<Cell> {
        let Some(rows) = pred.rows() else {
            return self.cells();
        };
        let (Some(lower), Some(last)) = (rows.lowest_bound(), rows.iter().last()) else {
            return Vec::new();
        };
        let upper = last.upper();
        // The smallest key of a row has an empty column and the newest time.
        let start = match lower {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(row) | Bound::Excluded(row) => {
                Bound::Included(CellKey::new(row.clone(), Bytes::new(), i64::MAX))
            }
        };
        self.data
            .range((start, Bound::Unbounded))
            .skip_while(|e| matches!(lower, Bound::Excluded(row) if e.key().row() == row))
            .take_while(|e| match upper {
                Bound::Unbounded => true,
                Bound::Included(row) => e.key().row() <= row,
                Bound::Excluded(row) => e.key().row() < row,
            })
            .map(|e| Cell::from_key(e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTable")
            .field("uri", &self.uri)
            .field("cells", &self.data.len())
            .field("size", &self.memory_size())
            .finish()
    }
}

impl Fragment for MemoryTable {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_block(&self, pred: &ScanPredicate, min_block: usize) -> Result<Option<usize>> {
        if min_block > 0 || self.is_empty() || pred.has_no_rows() {
            return Ok(None);
        }
        Ok(Some(0))
    }

    fn load_block(&self, addr: usize) -> Result<Arc<CellBlock>> {
        self.load_block_for(addr, &ScanPredicate::new())
    }

    fn load_block_for(&self, addr: usize, pred: &ScanPredicate) -> Result<Arc<CellBlock>> {
        if addr != 0 {
            return Err(Error::invalid_argument(format!("memory table has no block {}", addr)));
        }
        Ok(Arc::new(CellBlock::new(self.cells_for(pred))))
    }

    fn disk_size(&self) -> u64 {
        self.memory_size() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{Interval, IntervalSet};

    #[test]
    fn test_insert_orders_cells() {
        let mem = MemoryTable::new("mem");
        mem.set("b", "x", 1, "b1");
        mem.set("a", "x", 1, "a1");
        mem.set("a", "x", 5, "a5");
        mem.erase("a", "w", 3);
        let cells = mem.cells();
        let shown: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        assert_eq!(shown, vec!["(a,w,3,ERASED)", "(a,x,5,a5)", "(a,x,1,a1)", "(b,x,1,b1)"]);
    }

    #[test]
    fn test_replace_same_key() {
        let mem = MemoryTable::new("mem");
        mem.set("r", "c", 1, "first");
        let size = mem.memory_size();
        mem.set("r", "c", 1, "second!");
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.memory_size(), size + 2);
        mem.erase("r", "c", 1);
        assert!(mem.get(&CellKey::new("r", "c", 1)).unwrap().is_erasure());
    }

    #[test]
    fn test_block_sees_later_writes() {
        let mem = MemoryTable::new("mem");
        mem.set("r", "c", 1, "v");
        let pred = ScanPredicate::new();
        assert_eq!(mem.next_block(&pred, 0).unwrap(), Some(0));
        assert_eq!(mem.next_block(&pred, 1).unwrap(), None);
        let first = mem.load_block(0).unwrap();
        mem.set("s", "c", 1, "w");
        let second = mem.load_block(0).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    fn rows_of(block: &CellBlock) -> Vec<String> {
        block.cells().iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_point_scan_copies_one_row() {
        let mem = MemoryTable::new("mem");
        for i in 0..1000 {
            mem.set(format!("row{:04}", i), "c", 1, "v");
        }
        mem.set("row0500", "b", 2, "w");
        let pred = ScanPredicate::new().with_rows(IntervalSet::from_interval(Interval::point(Bytes::from("row0500"))));
        let block = mem.load_block_for(0, &pred).unwrap();
        assert_eq!(rows_of(&block), vec!["(row0500,b,2,w)", "(row0500,c,1,v)"]);

        mem.set("row0500", "d", 3, "x");
        assert_eq!(mem.load_block_for(0, &pred).unwrap().len(), 3);
    }

    #[test]
    fn test_block_covers_row_hull() {
        let mem = MemoryTable::new("mem");
        for row in ["a", "b", "c", "d", "e"] {
            mem.set(row, "c", 1, row);
        }
        let mut rows = IntervalSet::new();
        rows.add(Interval::new(Bound::Excluded(Bytes::from("a")), Bound::Included(Bytes::from("b"))));
        rows.add(Interval::new(Bound::Included(Bytes::from("d")), Bound::Excluded(Bytes::from("e"))));
        let block = mem.load_block_for(0, &ScanPredicate::new().with_rows(rows)).unwrap();
        // Rows between the intervals are left for the reader to filter.
        assert_eq!(rows_of(&block), vec!["(b,c,1,b)", "(c,c,1,c)", "(d,c,1,d)"]);

        let open = Interval::new(Bound::Unbounded, Bound::Excluded(Bytes::from("c")));
        let block = mem.load_block_for(0, &ScanPredicate::new().with_rows(IntervalSet::from_interval(open))).unwrap();
        assert_eq!(rows_of(&block), vec!["(a,c,1,a)", "(b,c,1,b)"]);
    }

    #[test]
    fn test_empty_table_has_no_blocks() {
        let mem = MemoryTable::new("mem");
        assert_eq!(mem.next_block(&ScanPredicate::new(), 0).unwrap(), None);
        assert!(mem.load_block(1).is_err());
    }
}

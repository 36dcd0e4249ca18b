//! Fragments: immutable, block-addressable sorted cell sources.
//!
//! A fragment is a sequence of cell blocks in key order. Scans ask a
//! fragment for the next block that may hold cells matching a predicate,
//! load it, and read it through a [`BlockReader`] that applies the
//! predicate to each cell. Disk fragments, memory tables and placeholders
//! for missing files all implement [`Fragment`].

pub mod block;
pub mod disk;
pub mod empty;
pub mod footer;
pub mod index;
pub mod loader;
pub mod restricted;
pub mod writer;

use crate::cell::{Cell, CellKey};
use crate::error::Result;
use crate::predicate::ScanPredicate;
use crate::tracker::AutoTracker;
use bytes::Bytes;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

pub use disk::DiskFragment;
pub use empty::EmptyFragment;
pub use loader::{CachedFragmentLoader, FragmentLoader};
pub use restricted::RestrictedFragment;
pub use writer::DiskFragmentWriter;

/// A sorted, block-addressable source of cells.
pub trait Fragment: Send + Sync + fmt::Debug {
    /// Location of the fragment, for logging and persistence.
    fn uri(&self) -> &str;

    /// Address of the first block at or after `min_block` that may contain
    /// cells matching `pred`, or `None` when no such block exists.
    fn next_block(&self, pred: &ScanPredicate, min_block: usize) -> Result<Option<usize>>;

    /// Load the block at `addr`.
    fn load_block(&self, addr: usize) -> Result<Arc<CellBlock>>;

    /// Load the block at `addr` for a scan by `pred`. The block may leave
    /// out cells `pred` cannot match.
    fn load_block_for(&self, addr: usize, _pred: &ScanPredicate) -> Result<Arc<CellBlock>> {
        self.load_block(addr)
    }

    /// Bytes the fragment occupies in storage.
    fn disk_size(&self) -> u64;

    /// Read a loaded block, filtering by `pred`.
    fn make_reader(&self, block: Arc<CellBlock>, pred: &Arc<ScanPredicate>) -> BlockReader {
        BlockReader::new(block, Arc::clone(pred))
    }

    /// Hand over the file guard of a superseded fragment.
    ///
    /// Fragments backed by a file keep the guard until they are dropped so
    /// the file outlives every open reader. Others release it immediately.
    fn retire(&self, guard: AutoTracker) {
        drop(guard);
    }
}

/// A decoded block of cells in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellBlock {
    cells: Vec<Cell>,
}

impl CellBlock {
    /// Wrap cells that are already in key order.
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    /// The cells.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if the block holds no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Limits on a single batch of output, compared against the running totals
/// of a [`CellOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimit {
    /// Stop once the output holds this many cells.
    pub max_cells: usize,
    /// Stop once the output holds this many bytes of cell data.
    pub max_size: usize,
}

impl BatchLimit {
    /// Limit by cell count and data size.
    pub fn new(max_cells: usize, max_size: usize) -> Self {
        Self { max_cells, max_size }
    }

    /// No limit.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    /// Allow `cells` more cells and `size` more bytes beyond what `out`
    /// already holds.
    pub fn beyond(out: &dyn CellOutput, cells: usize, size: usize) -> Self {
        Self::new(out.cell_count().saturating_add(cells), out.data_size().saturating_add(size))
    }

    /// True if `out` has reached either limit.
    pub fn reached(&self, out: &dyn CellOutput) -> bool {
        out.cell_count() >= self.max_cells || out.data_size() >= self.max_size
    }
}

/// A sink for cells produced in key order.
pub trait CellOutput {
    /// Emit a live cell.
    fn emit_cell(&mut self, key: &CellKey, value: &Bytes) -> Result<()>;

    /// Emit an erasure.
    fn emit_erasure(&mut self, key: &CellKey) -> Result<()>;

    /// Cells emitted so far.
    fn cell_count(&self) -> usize;

    /// Bytes of cell data emitted so far.
    fn data_size(&self) -> usize;

    /// Emit a cell of either kind.
    fn emit(&mut self, cell: &Cell) -> Result<()> {
        match cell.value() {
            Some(value) => self.emit_cell(cell.key(), value),
            None => self.emit_erasure(cell.key()),
        }
    }
}

/// A [`CellOutput`] that writes a new fragment.
pub trait FragmentWriter: CellOutput {
    /// Complete the fragment and return its size in bytes.
    fn finish(&mut self) -> Result<u64>;
}

/// A [`CellOutput`] collecting cells in memory.
#[derive(Debug, Clone, Default)]
pub struct CellBuffer {
    cells: Vec<Cell>,
    data_size: usize,
}

impl CellBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cell.
    pub fn push(&mut self, cell: Cell) {
        self.data_size += cell.data_size();
        self.cells.push(cell);
    }

    /// The collected cells.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Number of collected cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Take the collected cells, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Cell> {
        self.data_size = 0;
        std::mem::take(&mut self.cells)
    }

    /// Consume the buffer.
    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }
}

impl CellOutput for CellBuffer {
    fn emit_cell(&mut self, key: &CellKey, value: &Bytes) -> Result<()> {
        self.push(Cell::from_key(key.clone(), Some(value.clone())));
        Ok(())
    }

    fn emit_erasure(&mut self, key: &CellKey) -> Result<()> {
        self.push(Cell::from_key(key.clone(), None));
        Ok(())
    }

    fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn data_size(&self) -> usize {
        self.data_size
    }
}

/// Cursor over a loaded block that yields only cells matching a predicate.
///
/// `advance` positions on the next matching cell without consuming it;
/// `skip_current` consumes it.
#[derive(Debug)]
pub struct BlockReader {
    block: Arc<CellBlock>,
    pred: Arc<ScanPredicate>,
    pos: usize,
}

impl BlockReader {
    /// Read `block`, starting at the first cell the row restriction allows.
    pub fn new(block: Arc<CellBlock>, pred: Arc<ScanPredicate>) -> Self {
        let pos = match pred.rows().and_then(|rows| rows.lowest_bound()) {
            Some(Bound::Included(lo)) => block.cells.partition_point(|c| c.row() < lo),
            Some(Bound::Excluded(lo)) => block.cells.partition_point(|c| c.row() <= lo),
            _ => 0,
        };
        Self { block, pred, pos }
    }

    /// Move to the next matching cell and return its key.
    pub fn advance(&mut self) -> Option<&CellKey> {
        let cells = self.block.cells();
        while self.pos < cells.len() && !self.pred.matches(cells[self.pos].key()) {
            self.pos += 1;
        }
        cells.get(self.pos).map(|c| c.key())
    }

    /// The cell under the cursor, matching or not.
    pub fn current(&self) -> Option<&Cell> {
        self.block.cells().get(self.pos)
    }

    /// Consume the cell under the cursor.
    pub fn skip_current(&mut self) {
        if self.pos < self.block.len() {
            self.pos += 1;
        }
    }

    /// Copy matching cells to `out` until a key at or past `stop`, the end
    /// of the block, or `limit`.
    ///
    /// Always consumes at least the current cell when it lies before
    /// `stop`. With `filter_erasures`, erasures are consumed but not
    /// emitted.
    pub fn copy_until(
        &mut self,
        stop: Option<&CellKey>,
        out: &mut dyn CellOutput,
        limit: &BatchLimit,
        filter_erasures: bool,
    ) -> Result<()> {
        let cells = self.block.cells();
        while self.pos < cells.len() {
            let cell = &cells[self.pos];
            if stop.is_some_and(|s| cell.key() >= s) {
                break;
            }
            self.pos += 1;
            if !self.pred.matches(cell.key()) || (filter_erasures && cell.is_erasure()) {
                continue;
            }
            out.emit(cell)?;
            if limit.reached(out) {
                break;
            }
        }
        Ok(())
    }
}

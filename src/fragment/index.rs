//! Block index of a disk fragment.
//!
//! The index is one `bincode`-encoded record holding an entry per block.
//! Each entry carries enough to decide, without reading the block, whether
//! a scan predicate could match anything in it: the row range, the
//! timestamp range and a filter over column families.

use crate::cell::CellKey;
use crate::error::{Error, Result};
use crate::filter::{BloomFilter, Filter};
use crate::fragment::block::BlockSummary;
use crate::fragment::footer::BlockHandle;
use crate::interval::{Interval, IntervalSet};
use crate::predicate::ScanPredicate;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Version of the index record layout.
pub const INDEX_VERSION: u32 = 1;

/// Index entry for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Row of the first cell.
    pub start_row: Vec<u8>,
    /// Column of the first cell.
    pub start_column: Vec<u8>,
    /// Timestamp of the first cell.
    pub start_timestamp: i64,
    /// Row of the last cell.
    pub last_row: Vec<u8>,
    /// Offset of the stored block in the file.
    pub block_offset: u64,
    /// Size of the stored block including its trailer.
    pub block_size: u64,
    /// Encoded column family filter.
    pub family_filter: Vec<u8>,
    /// Smallest timestamp in the block.
    pub min_timestamp: i64,
    /// Largest timestamp in the block.
    pub max_timestamp: i64,
    /// Number of cells, erasures included.
    pub cell_count: u32,
    /// Number of erasures.
    pub erasure_count: u32,
}

impl IndexEntry {
    /// Build an entry from a block summary and the block's location.
    pub fn new(summary: &BlockSummary, handle: BlockHandle) -> Self {
        Self {
            start_row: summary.first_key.row().to_vec(),
            start_column: summary.first_key.column().to_vec(),
            start_timestamp: summary.first_key.timestamp(),
            last_row: summary.last_row.to_vec(),
            block_offset: handle.offset,
            block_size: handle.size,
            family_filter: summary.family_filter.encode(),
            min_timestamp: summary.min_timestamp,
            max_timestamp: summary.max_timestamp,
            cell_count: summary.cell_count,
            erasure_count: summary.erasure_count,
        }
    }

    /// Location of the stored block.
    pub fn handle(&self) -> BlockHandle {
        BlockHandle::new(self.block_offset, self.block_size)
    }

    /// Key of the first cell.
    pub fn start_key(&self) -> CellKey {
        CellKey::new(self.start_row.clone(), self.start_column.clone(), self.start_timestamp)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    version: u32,
    entries: Vec<IndexEntry>,
}

/// Decoded block index with its filters ready for probing.
#[derive(Debug, Clone)]
pub struct FragmentIndex {
    entries: Vec<IndexEntry>,
    filters: Vec<BloomFilter>,
    cell_count: u64,
}

impl FragmentIndex {
    /// Build an index from its entries.
    pub fn new(entries: Vec<IndexEntry>) -> Result<Self> {
        let filters = entries
            .iter()
            .map(|e| BloomFilter::decode(&e.family_filter))
            .collect::<Result<Vec<_>>>()?;
        let cell_count = entries.iter().map(|e| e.cell_count as u64).sum();
        Ok(Self { entries, filters, cell_count })
    }

    /// Encode the index record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let record = IndexRecord { version: INDEX_VERSION, entries: self.entries.clone() };
        Ok(bincode::serialize(&record)?)
    }

    /// Decode an index record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let record: IndexRecord = bincode::deserialize(data)?;
        if record.version != INDEX_VERSION {
            return Err(Error::corruption(format!(
                "unsupported fragment index version {}",
                record.version
            )));
        }
        Self::new(record.entries)
    }

    /// The block entries.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    /// Total cells across all blocks.
    pub fn cell_count(&self) -> u64 {
        self.cell_count
    }

    /// First block at or after `min_block` that may hold matching cells.
    pub fn next_block(&self, pred: &ScanPredicate, min_block: usize) -> Option<usize> {
        if pred.has_no_rows() {
            return None;
        }
        let families = pred.column_families();
        (min_block..self.entries.len()).find(|&i| {
            let entry = &self.entries[i];
            rows_may_match(pred.rows(), entry)
                && times_may_match(pred.times(), entry)
                && families.map_or(true, |f| self.filters[i].may_contain_any(f))
        })
    }
}

fn rows_may_match(rows: Option<&IntervalSet<Bytes>>, entry: &IndexEntry) -> bool {
    match rows {
        None => true,
        Some(rows) => {
            let span = Interval::new(
                Bound::Included(Bytes::copy_from_slice(&entry.start_row)),
                Bound::Included(Bytes::copy_from_slice(&entry.last_row)),
            );
            rows.overlaps(&span)
        }
    }
}

fn times_may_match(times: Option<&IntervalSet<i64>>, entry: &IndexEntry) -> bool {
    match times {
        None => true,
        Some(times) => times.overlaps(&Interval::closed(entry.min_timestamp, entry.max_timestamp)),
    }
}

//! Bounded record of recent row commits.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Bytes charged per entry on top of the row length.
pub const ENTRY_OVERHEAD: usize = 48;

/// Remembers the last commit of recently written rows.
///
/// Entries are kept in commit order. Once the ring grows past its purge
/// threshold the oldest entries are dropped until it is half full, and the
/// newest dropped commit becomes the lower bound reported for any row no
/// longer in the ring.
#[derive(Debug)]
pub struct CommitRing {
    rows: HashMap<Bytes, (i64, u64)>,
    order: VecDeque<(Bytes, i64, u64)>,
    min_txn: i64,
    max_txn: i64,
    current_size: usize,
    purge_threshold: usize,
    next_seq: u64,
}

impl CommitRing {
    /// An empty ring that purges past `purge_threshold` bytes.
    pub fn new(purge_threshold: usize) -> Self {
        Self::starting_at(purge_threshold, 0)
    }

    /// An empty ring whose lower bound is `min_txn`.
    pub fn starting_at(purge_threshold: usize, min_txn: i64) -> Self {
        Self {
            rows: HashMap::new(),
            order: VecDeque::new(),
            min_txn,
            max_txn: min_txn,
            current_size: 0,
            purge_threshold,
            next_seq: 0,
        }
    }

    /// Last commit of `row`, or a lower bound on it.
    pub fn get_commit(&self, row: &[u8]) -> i64 {
        self.rows.get(row).map(|&(txn, _)| txn).unwrap_or(self.min_txn)
    }

    /// Lower bound for rows not in the ring.
    pub fn get_min_commit(&self) -> i64 {
        self.min_txn
    }

    /// Newest commit recorded, or the lower bound when empty.
    pub fn get_max_commit(&self) -> i64 {
        if self.rows.is_empty() {
            self.min_txn
        } else {
            self.max_txn
        }
    }

    /// Record that `row` committed at `txn`.
    ///
    /// Commits must be recorded in non-decreasing order.
    pub fn set_commit(&mut self, row: Bytes, txn: i64) -> Result<()> {
        if txn < self.max_txn {
            return Err(Error::invalid_argument(format!(
                "commit {} recorded after {}",
                txn, self.max_txn
            )));
        }
        self.max_txn = txn;
        self.next_seq += 1;
        let seq = self.next_seq;
        // A rewritten row leaves its older record queued; it is charged
        // until popped.
        self.rows.insert(row.clone(), (txn, seq));
        self.current_size += ENTRY_OVERHEAD + row.len();
        self.order.push_back((row, txn, seq));
        if self.current_size > self.purge_threshold {
            self.purge();
        }
        Ok(())
    }

    /// Number of distinct rows held.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no row is held.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate memory held, in bytes.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    fn purge(&mut self) {
        let target = self.purge_threshold / 2;
        while self.current_size > target {
            let Some((row, txn, seq)) = self.order.pop_front() else {
                break;
            };
            self.current_size -= ENTRY_OVERHEAD + row.len();
            if self.rows.get(&row).is_some_and(|&(_, live)| live == seq) {
                self.rows.remove(&row);
                self.min_txn = self.min_txn.max(txn);
            }
        }
        log::debug!(
            "Purged commit ring to {} rows, min commit {}",
            self.rows.len(),
            self.min_txn
        );
    }
}

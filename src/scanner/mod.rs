//! Scanners over live tables.
//!
//! A [`Scanner`] reads one tablet. When the fragments under the tablet
//! change, the scanner is flagged and its next [`Scanner::get`] rebuilds the
//! merge from the rows at or after the last delivered cell, silently
//! discarding anything already delivered. A [`SuperScanner`] chains scanners
//! across the tablets of a table, and a [`TableScanner`] adds scan modes
//! and batching for clients.

mod super_scanner;
mod table_scanner;

pub use super_scanner::SuperScanner;
pub use table_scanner::{ScanBatch, ScanMode, TableScanner};

use crate::cell::CellKey;
use crate::error::Result;
use crate::fragment::{BatchLimit, CellOutput};
use crate::interval::Interval;
use crate::merge::FragmentMerge;
use crate::predicate::ScanPredicate;
use crate::table::{FragmentListener, Table};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ReopenFlag {
    rows: Interval<Bytes>,
    reopen: AtomicBool,
}

impl FragmentListener for ReopenFlag {
    fn fragments_changed(&self, _table: &str, rows: &Interval<Bytes>) {
        if self.rows.overlaps(rows) {
            self.reopen.store(true, Ordering::Release);
        }
    }
}

/// Wraps an output to remember the last key emitted and to drop keys at
/// or before a catch-up point.
struct TrackingOutput<'a, O: CellOutput + ?Sized> {
    out: &'a mut O,
    skip_through: Option<&'a CellKey>,
    last: &'a mut Option<CellKey>,
}

impl<O: CellOutput + ?Sized> TrackingOutput<'_, O> {
    fn admit(&mut self, key: &CellKey) -> bool {
        if let Some(point) = self.skip_through {
            if key <= point {
                return false;
            }
            self.skip_through = None;
        }
        *self.last = Some(key.clone());
        true
    }
}

impl<O: CellOutput + ?Sized> CellOutput for TrackingOutput<'_, O> {
    fn emit_cell(&mut self, key: &CellKey, value: &Bytes) -> Result<()> {
        if self.admit(key) {
            self.out.emit_cell(key, value)?;
        }
        Ok(())
    }

    fn emit_erasure(&mut self, key: &CellKey) -> Result<()> {
        if self.admit(key) {
            self.out.emit_erasure(key)?;
        }
        Ok(())
    }

    fn cell_count(&self) -> usize {
        self.out.cell_count()
    }

    fn data_size(&self) -> usize {
        self.out.data_size()
    }
}

/// Cursor over one tablet of a table.
pub struct Scanner {
    table: Arc<Table>,
    rows: Interval<Bytes>,
    pred: ScanPredicate,
    filter_erasures: bool,
    flag: Arc<ReopenFlag>,
    merge: Option<FragmentMerge>,
    last: Option<CellKey>,
    catch_up: Option<CellKey>,
    reopened_row: Option<Bytes>,
    done: bool,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("table", &self.table.name())
            .field("rows", &self.rows)
            .field("last", &self.last)
            .field("done", &self.done)
            .finish()
    }
}

impl Scanner {
    /// Scan the tablet of `table` covering `rows` with `pred`.
    pub fn open(table: Arc<Table>, rows: Interval<Bytes>, pred: ScanPredicate, filter_erasures: bool) -> Self {
        let flag = Arc::new(ReopenFlag { rows: rows.clone(), reopen: AtomicBool::new(false) });
        let listener: Arc<dyn FragmentListener> = flag.clone();
        table.add_listener(Arc::downgrade(&listener));
        Self {
            pred: pred.clip_rows(&rows),
            table,
            rows,
            filter_erasures,
            flag,
            merge: None,
            last: None,
            catch_up: None,
            reopened_row: None,
            done: false,
        }
    }

    /// Rows of the tablet being scanned.
    pub fn rows(&self) -> &Interval<Bytes> {
        &self.rows
    }

    /// Last key delivered.
    pub fn last_key(&self) -> Option<&CellKey> {
        self.last.as_ref()
    }

    /// Flag the scanner to rebuild its merge before the next batch.
    pub fn reopen(&self) {
        self.flag.reopen.store(true, Ordering::Release);
    }

    /// Row of the last delivered key at the most recent reopen, cleared by
    /// this call.
    pub fn take_reopened_row(&mut self) -> Option<Bytes> {
        self.reopened_row.take()
    }

    /// Copy cells to `out` until `limit` is reached. Returns true while more
    /// cells may follow.
    pub fn get(&mut self, out: &mut dyn CellOutput, limit: BatchLimit) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if self.flag.reopen.swap(false, Ordering::AcqRel) && self.merge.is_some() {
            self.merge = None;
            if let Some(last) = &self.last {
                log::debug!("Reopening scan of {} after {:?}", self.table.name(), last);
                self.catch_up = Some(last.clone());
                self.reopened_row = Some(last.row().clone());
            }
        }
        if self.merge.is_none() {
            self.merge = Some(self.open_merge()?);
        }

        let more = match self.merge.as_mut() {
            Some(merge) => {
                let mut tracking = TrackingOutput {
                    out,
                    skip_through: self.catch_up.as_ref(),
                    last: &mut self.last,
                };
                let more = merge.next_batch(&mut tracking, limit)?;
                let caught_up = tracking.skip_through.is_none();
                if caught_up {
                    self.catch_up = None;
                }
                more
            }
            None => false,
        };
        if !more {
            self.done = true;
            self.merge = None;
        }
        Ok(more)
    }

    fn open_merge(&self) -> Result<FragmentMerge> {
        let pred = match &self.last {
            Some(last) => self.pred.clip_rows(&Interval::at_least(last.row().clone())),
            None => self.pred.clone(),
        };
        let (_, chain) = self.table.fragment_chain(self.rows.lower())?;
        FragmentMerge::new(chain, pred, self.filter_erasures)
    }
}

use super::Scanner;
use crate::error::Result;
use crate::fragment::{BatchLimit, CellOutput};
use crate::interval::{Interval, IntervalSet};
use crate::predicate::ScanPredicate;
use crate::table::Table;
use bytes::Bytes;
use std::ops::Bound;
use std::sync::Arc;

/// Scans every tablet of a table that the predicate's rows touch, one
/// tablet at a time in row order.
///
/// When a tablet is exhausted the remaining rows are clipped to start just
/// past its upper bound, and the tablet admitting that new lower bound is
/// scanned next. A gap in the loaded tablets ends the scan with
/// `TabletNotLoaded`.
#[derive(Debug)]
pub struct SuperScanner {
    table: Arc<Table>,
    pred: ScanPredicate,
    remaining: IntervalSet<Bytes>,
    current: Option<Scanner>,
    filter_erasures: bool,
    reopened_rows: Vec<Bytes>,
}

impl SuperScanner {
    /// Scan `table` with `pred`.
    pub fn open(table: Arc<Table>, pred: ScanPredicate, filter_erasures: bool) -> Self {
        let remaining = pred.row_set();
        Self { table, pred, remaining, current: None, filter_erasures, reopened_rows: Vec::new() }
    }

    /// Rows that were partly delivered when a tablet scan reopened since
    /// the last call.
    pub fn take_reopened_rows(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.reopened_rows)
    }

    /// Flag the current tablet scan, if any, to reopen.
    pub fn reopen(&self) {
        if let Some(scanner) = &self.current {
            scanner.reopen();
        }
    }

    /// Copy cells to `out` until `limit` is reached. Returns true while more
    /// cells may follow.
    pub fn get(&mut self, out: &mut dyn CellOutput, limit: BatchLimit) -> Result<bool> {
        loop {
            if self.current.is_none() {
                let Some(lower) = self.remaining.lowest_bound().cloned() else {
                    return Ok(false);
                };
                let (rows, _) = self.table.fragment_chain(&lower)?;
                log::trace!("Scanning tablet {:?} of {}", rows, self.table.name());
                self.current = Some(Scanner::open(
                    Arc::clone(&self.table),
                    rows,
                    self.pred.clone(),
                    self.filter_erasures,
                ));
            }
            let Some(scanner) = self.current.as_mut() else {
                return Ok(false);
            };
            let more = scanner.get(out, limit)?;
            if let Some(row) = scanner.take_reopened_row() {
                self.reopened_rows.push(row);
            }
            if more {
                return Ok(true);
            }
            match scanner.rows().upper_adjacent_complement() {
                Some(next) => self.remaining.clip(&Interval::new(next, Bound::Unbounded)),
                None => self.remaining = IntervalSet::new(),
            }
            self.current = None;
            if limit.reached(out) {
                return Ok(!self.remaining.is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::compaction::fragdag::TabletId;
    use crate::error::Error;
    use crate::fragment::CellBuffer;
    use crate::table::Tablet;

    fn tablet(id: u64, lower: Bound<&'static str>, upper: Bound<&'static str>) -> Tablet {
        let conv = |b: Bound<&'static str>| match b {
            Bound::Included(v) => Bound::Included(Bytes::from(v)),
            Bound::Excluded(v) => Bound::Excluded(Bytes::from(v)),
            Bound::Unbounded => Bound::Unbounded,
        };
        Tablet { id: TabletId(id), name: format!("t{}", id), rows: Interval::new(conv(lower), conv(upper)), fragments: Vec::new() }
    }

    fn scan_rows(scanner: &mut SuperScanner, per_batch: usize) -> Result<Vec<String>> {
        let mut rows = Vec::new();
        loop {
            let mut out = CellBuffer::new();
            let more = scanner.get(&mut out, BatchLimit::new(per_batch, usize::MAX))?;
            rows.extend(out.cells().iter().map(|c| String::from_utf8_lossy(c.row()).into_owned()));
            if !more {
                return Ok(rows);
            }
        }
    }

    fn cells() -> Vec<Cell> {
        ["a", "f", "m", "n", "x"].iter().map(|r| Cell::new(*r, "c", 1, "v")).collect()
    }

    #[test]
    fn test_scans_across_tablets() {
        let table = Arc::new(Table::new(
            "t",
            vec![
                tablet(1, Bound::Unbounded, Bound::Included("f")),
                tablet(2, Bound::Excluded("f"), Bound::Included("m")),
                tablet(3, Bound::Excluded("m"), Bound::Unbounded),
            ],
            1 << 20,
        ));
        table.apply_cells(cells()).unwrap();
        let mut scanner = SuperScanner::open(Arc::clone(&table), ScanPredicate::new(), true);
        assert_eq!(scan_rows(&mut scanner, 2).unwrap(), vec!["a", "f", "m", "n", "x"]);

        let pred = ScanPredicate::parse("row >= 'g' and row < 'o'").unwrap();
        let mut scanner = SuperScanner::open(table, pred, true);
        assert_eq!(scan_rows(&mut scanner, 1).unwrap(), vec!["m", "n"]);
    }

    #[test]
    fn test_gap_is_not_loaded() {
        let table = Arc::new(Table::new(
            "t",
            vec![
                tablet(1, Bound::Unbounded, Bound::Included("f")),
                tablet(3, Bound::Excluded("m"), Bound::Unbounded),
            ],
            1 << 20,
        ));
        table.apply_cells(cells()).unwrap();
        let mut scanner = SuperScanner::open(table, ScanPredicate::new(), true);
        let err = scan_rows(&mut scanner, 10).unwrap_err();
        assert!(matches!(err, Error::TabletNotLoaded(_)));
    }
}

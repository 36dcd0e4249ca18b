//! Merges the fragments under row ranges into one output fragment.

use crate::compaction::fragdag::FragmentId;
use crate::error::Result;
use crate::fragment::{BatchLimit, Fragment, FragmentWriter};
use crate::interval::{Interval, IntervalSet};
use crate::merge::FragmentMerge;
use crate::predicate::ScanPredicate;
use crate::worker::WorkerControl;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cells copied between cancellation checks.
const CHECK_INTERVAL_CELLS: usize = 4096;

/// The fragments covering one row range, oldest first.
#[derive(Debug, Clone)]
pub struct RangeFragments {
    /// Rows of the range.
    pub rows: Interval<Bytes>,
    /// Graph ids of the fragments.
    pub ids: Vec<FragmentId>,
    /// The open fragments, parallel to `ids`.
    pub fragments: Vec<Arc<dyn Fragment>>,
}

/// Row ranges to compact. Ranges are disjoint and sorted by row.
pub type RangeFragmentMap = Vec<RangeFragments>;

/// A range whose cells were written to the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedRange {
    /// Rows of the range.
    pub rows: Interval<Bytes>,
    /// Fragments the output replaces in this range.
    pub ids: Vec<FragmentId>,
    /// Cells written for this range.
    pub cell_count: usize,
}

/// Limits after which a compaction stops taking new ranges.
#[derive(Debug, Clone, Copy)]
pub struct CompactionBudget {
    /// Bytes of cell data written.
    pub output: u64,
    /// Time elapsed.
    pub time: Duration,
}

impl CompactionBudget {
    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self { output: u64::MAX, time: Duration::MAX }
    }
}

/// Merges ranges of a [`RangeFragmentMap`] into a single fragment writer.
#[derive(Debug)]
pub struct Compactor {
    drop_erasures: bool,
    budget: CompactionBudget,
}

impl Compactor {
    /// A compactor. Erasures are dropped only when `drop_erasures` is set,
    /// which is safe when nothing older lies beneath the inputs.
    pub fn new(drop_erasures: bool, budget: CompactionBudget) -> Self {
        Self { drop_erasures, budget }
    }

    /// Compact `map` in row order into `out`.
    ///
    /// The first range is always compacted; later ranges are skipped once
    /// the budget runs out. Returns the ranges actually written, which may
    /// be a prefix of `map`. Cancellation is checked between batches and
    /// surfaces as [`crate::Error::Cancelled`], leaving `out` unfinished.
    pub fn compact(
        &self,
        map: &[RangeFragments],
        out: &mut dyn FragmentWriter,
        control: &WorkerControl,
    ) -> Result<Vec<CompactedRange>> {
        let started = Instant::now();
        let mut done = Vec::with_capacity(map.len());
        for range in map {
            if !done.is_empty() && self.over_budget(out, started) {
                log::info!("Compaction budget reached after {} of {} ranges", done.len(), map.len());
                break;
            }
            control.check()?;

            let before = out.cell_count();
            let pred = ScanPredicate::new().with_rows(IntervalSet::from_interval(range.rows.clone()));
            let mut merge = FragmentMerge::new(range.fragments.clone(), pred, self.drop_erasures)?;
            loop {
                let limit = BatchLimit::beyond(out, CHECK_INTERVAL_CELLS, usize::MAX);
                let more = merge.next_batch(out, limit)?;
                if !more {
                    break;
                }
                control.check()?;
            }
            done.push(CompactedRange {
                rows: range.rows.clone(),
                ids: range.ids.clone(),
                cell_count: out.cell_count() - before,
            });
        }
        Ok(done)
    }

    fn over_budget(&self, out: &dyn FragmentWriter, started: Instant) -> bool {
        out.data_size() as u64 >= self.budget.output || started.elapsed() >= self.budget.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::fragment::{CellBuffer, CellOutput};
    use crate::memtable::MemoryTable;
    use bytes::Bytes;

    /// Collects output in memory.
    #[derive(Default)]
    struct BufferWriter {
        buf: CellBuffer,
        finished: bool,
    }

    impl CellOutput for BufferWriter {
        fn emit_cell(&mut self, key: &crate::cell::CellKey, value: &Bytes) -> Result<()> {
            self.buf.emit_cell(key, value)
        }

        fn emit_erasure(&mut self, key: &crate::cell::CellKey) -> Result<()> {
            self.buf.emit_erasure(key)
        }

        fn cell_count(&self) -> usize {
            self.buf.cell_count()
        }

        fn data_size(&self) -> usize {
            self.buf.data_size()
        }
    }

    impl FragmentWriter for BufferWriter {
        fn finish(&mut self) -> Result<u64> {
            self.finished = true;
            Ok(self.buf.data_size() as u64)
        }
    }

    fn fragment(uri: &str, cells: Vec<Cell>) -> Arc<dyn Fragment> {
        let mem = MemoryTable::new(uri);
        mem.insert_all(cells);
        Arc::new(mem)
    }

    fn range(lo: Option<&str>, hi: Option<&str>, frags: Vec<(u64, Arc<dyn Fragment>)>) -> RangeFragments {
        let lower = match lo {
            Some(v) => std::ops::Bound::Excluded(Bytes::from(v.to_string())),
            None => std::ops::Bound::Unbounded,
        };
        let upper = match hi {
            Some(v) => std::ops::Bound::Included(Bytes::from(v.to_string())),
            None => std::ops::Bound::Unbounded,
        };
        RangeFragments {
            rows: Interval::new(lower, upper),
            ids: frags.iter().map(|(id, _)| FragmentId(*id)).collect(),
            fragments: frags.into_iter().map(|(_, f)| f).collect(),
        }
    }

    fn rendered(out: &BufferWriter) -> Vec<String> {
        out.buf.cells().iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_merges_newest_first_and_keeps_erasures() {
        let old = fragment("old", vec![Cell::new("a", "c", 1, "old"), Cell::new("b", "c", 1, "b")]);
        let new = fragment("new", vec![Cell::new("a", "c", 1, "new"), Cell::erasure("b", "c", 1)]);
        let map = vec![range(None, None, vec![(1, old), (2, new)])];
        let mut out = BufferWriter::default();
        let compacted = Compactor::new(false, CompactionBudget::unlimited())
            .compact(&map, &mut out, &WorkerControl::new())
            .unwrap();
        assert_eq!(rendered(&out), vec!["(a,c,1,new)", "(b,c,1,ERASED)"]);
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].cell_count, 2);
        assert_eq!(compacted[0].ids, vec![FragmentId(1), FragmentId(2)]);
    }

    #[test]
    fn test_drops_erasures_when_rooted() {
        let old = fragment("old", vec![Cell::new("a", "c", 1, "a"), Cell::new("b", "c", 1, "b")]);
        let new = fragment("new", vec![Cell::erasure("b", "c", 1)]);
        let map = vec![range(None, None, vec![(1, old), (2, new)])];
        let mut out = BufferWriter::default();
        Compactor::new(true, CompactionBudget::unlimited())
            .compact(&map, &mut out, &WorkerControl::new())
            .unwrap();
        assert_eq!(rendered(&out), vec!["(a,c,1,a)"]);
    }

    #[test]
    fn test_ranges_clip_shared_fragments() {
        let shared = fragment("shared", vec![Cell::new("a", "c", 1, "1"), Cell::new("m", "c", 1, "2")]);
        let left = fragment("left", vec![Cell::new("b", "c", 1, "3")]);
        let map = vec![
            range(None, Some("f"), vec![(1, Arc::clone(&shared)), (2, left)]),
            range(Some("f"), None, vec![(1, shared)]),
        ];
        let mut out = BufferWriter::default();
        let compacted = Compactor::new(false, CompactionBudget::unlimited())
            .compact(&map, &mut out, &WorkerControl::new())
            .unwrap();
        assert_eq!(rendered(&out), vec!["(a,c,1,1)", "(b,c,1,3)", "(m,c,1,2)"]);
        assert_eq!(compacted.iter().map(|r| r.cell_count).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_budget_stops_after_first_range() {
        let a = fragment("a", vec![Cell::new("a", "c", 1, "1")]);
        let z = fragment("z", vec![Cell::new("z", "c", 1, "2")]);
        let map = vec![range(None, Some("f"), vec![(1, a)]), range(Some("f"), None, vec![(2, z)])];
        let budget = CompactionBudget { output: 1, time: Duration::MAX };
        let mut out = BufferWriter::default();
        let compacted = Compactor::new(false, budget).compact(&map, &mut out, &WorkerControl::new()).unwrap();
        assert_eq!(compacted.len(), 1);
        assert_eq!(rendered(&out), vec!["(a,c,1,1)"]);
    }

    #[test]
    fn test_cancelled() {
        let a = fragment("a", vec![Cell::new("a", "c", 1, "1")]);
        let map = vec![range(None, None, vec![(1, a)])];
        let control = WorkerControl::new();
        control.cancel();
        let mut out = BufferWriter::default();
        let err = Compactor::new(false, CompactionBudget::unlimited()).compact(&map, &mut out, &control).unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled));
        assert!(!out.finished);
    }
}

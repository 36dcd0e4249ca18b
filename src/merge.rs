//! K-way merges.
//!
//! [`FragmentMerge`] merges a chain of fragments, oldest first, into one
//! key-ordered stream. When several fragments hold the same key the newest
//! one wins and the shadowed versions are skipped. Runs of cells from a
//! single fragment are copied block-wise until the next fragment's key,
//! so the heap is only consulted at fragment boundaries.

use crate::cell::CellKey;
use crate::error::{Error, Result};
use crate::fragment::{BatchLimit, BlockReader, CellOutput, Fragment};
use crate::predicate::ScanPredicate;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::iter::Peekable;
use std::sync::Arc;

/// Merges individually sorted iterators into one sorted iterator.
///
/// With uniquing enabled, equal items from different inputs are emitted
/// once.
pub struct MergeIterator<I: Iterator> {
    inputs: Vec<Peekable<I>>,
    heap: BinaryHeap<HeapItem<I::Item>>,
    unique: bool,
    started: bool,
}

struct HeapItem<T> {
    item: T,
    source: usize,
}

impl<T: Ord> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapItem<T> {}

impl<T: Ord> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeapItem<T> {
    // Reversed so the max-heap pops the smallest item, lowest source first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.item.cmp(&self.item).then_with(|| other.source.cmp(&self.source))
    }
}

impl<I> MergeIterator<I>
where
    I: Iterator,
    I::Item: Ord,
{
    /// Merge `inputs`, keeping duplicates.
    pub fn new(inputs: impl IntoIterator<Item = I>) -> Self {
        Self::build(inputs, false)
    }

    /// Merge `inputs`, emitting each distinct item once.
    pub fn unique(inputs: impl IntoIterator<Item = I>) -> Self {
        Self::build(inputs, true)
    }

    fn build(inputs: impl IntoIterator<Item = I>, unique: bool) -> Self {
        Self {
            inputs: inputs.into_iter().map(Iterator::peekable).collect(),
            heap: BinaryHeap::new(),
            unique,
            started: false,
        }
    }

    fn refill(&mut self, source: usize) {
        if let Some(item) = self.inputs[source].next() {
            self.heap.push(HeapItem { item, source });
        }
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: Iterator,
    I::Item: Ord,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if !self.started {
            self.started = true;
            for source in 0..self.inputs.len() {
                self.refill(source);
            }
        }
        let top = self.heap.pop()?;
        self.refill(top.source);
        if self.unique {
            while self.heap.peek().is_some_and(|next| next.item == top.item) {
                if let Some(dup) = self.heap.pop() {
                    self.refill(dup.source);
                }
            }
            // Duplicates inside one input.
            while self.inputs[top.source].peek().is_some_and(|next| *next == top.item) {
                self.inputs[top.source].next();
            }
        }
        Some(top.item)
    }
}

struct MergeInput {
    fragment: Arc<dyn Fragment>,
    reader: Option<BlockReader>,
    next_block: usize,
}

impl MergeInput {
    // Position on the next matching cell, loading blocks as needed.
    fn advance(&mut self, pred: &Arc<ScanPredicate>) -> Result<Option<CellKey>> {
        loop {
            if let Some(reader) = self.reader.as_mut() {
                if let Some(key) = reader.advance() {
                    return Ok(Some(key.clone()));
                }
                self.reader = None;
            }
            match self.fragment.next_block(pred, self.next_block)? {
                Some(addr) => {
                    let block = self.fragment.load_block_for(addr, pred)?;
                    self.reader = Some(self.fragment.make_reader(block, pred));
                    self.next_block = addr + 1;
                }
                None => return Ok(None),
            }
        }
    }

    fn skip_current(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.skip_current();
        }
    }
}

#[derive(PartialEq, Eq)]
struct Head {
    key: CellKey,
    input: usize,
}

impl Ord for Head {
    // Smallest key first; for equal keys the newest fragment first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| self.input.cmp(&other.input))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges a fragment chain into batches of cells.
pub struct FragmentMerge {
    inputs: Vec<MergeInput>,
    heap: BinaryHeap<Head>,
    pred: Arc<ScanPredicate>,
    filter_erasures: bool,
    started: bool,
}

impl std::fmt::Debug for FragmentMerge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentMerge")
            .field("inputs", &self.inputs.len())
            .field("pending", &self.heap.len())
            .field("filter_erasures", &self.filter_erasures)
            .finish()
    }
}

impl FragmentMerge {
    /// Merge `chain`, ordered oldest to newest, restricted by `pred`.
    ///
    /// With `filter_erasures`, erasures hide the cells they shadow and are
    /// not emitted themselves. History limits are not supported.
    pub fn new(chain: Vec<Arc<dyn Fragment>>, pred: ScanPredicate, filter_erasures: bool) -> Result<Self> {
        if pred.max_history() != 0 {
            return Err(Error::invalid_argument("history-limited merges are not supported"));
        }
        let inputs = chain
            .into_iter()
            .map(|fragment| MergeInput { fragment, reader: None, next_block: 0 })
            .collect();
        Ok(Self { inputs, heap: BinaryHeap::new(), pred: Arc::new(pred), filter_erasures, started: false })
    }

    /// The predicate being applied.
    pub fn predicate(&self) -> &ScanPredicate {
        &self.pred
    }

    /// Copy merged cells into `out` until `limit` is reached or the merge
    /// is exhausted. Returns true while more cells may follow.
    pub fn next_batch(&mut self, out: &mut dyn CellOutput, limit: BatchLimit) -> Result<bool> {
        if !self.started {
            self.started = true;
            for input in 0..self.inputs.len() {
                self.push_next(input)?;
            }
        }
        while let Some(top) = self.heap.pop() {
            // Older versions of the same key are shadowed.
            while self.heap.peek().is_some_and(|h| h.key == top.key) {
                if let Some(dup) = self.heap.pop() {
                    self.inputs[dup.input].skip_current();
                    self.push_next(dup.input)?;
                }
            }
            let stop = self.heap.peek().map(|h| h.key.clone());
            if let Some(reader) = self.inputs[top.input].reader.as_mut() {
                reader.copy_until(stop.as_ref(), out, &limit, self.filter_erasures)?;
            }
            self.push_next(top.input)?;
            if limit.reached(out) {
                return Ok(!self.heap.is_empty());
            }
        }
        Ok(false)
    }

    /// Run the merge to completion into `out`.
    pub fn drain(&mut self, out: &mut dyn CellOutput) -> Result<()> {
        while self.next_batch(out, BatchLimit::unlimited())? {}
        Ok(())
    }

    fn push_next(&mut self, input: usize) -> Result<()> {
        if let Some(key) = self.inputs[input].advance(&self.pred)? {
            self.heap.push(Head { key, input });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::fragment::CellBuffer;
    use crate::memtable::MemoryTable;
    use proptest::prelude::*;

    const A: [i32; 7] = [1, 4, 6, 6, 7, 12, 15];
    const B: [i32; 7] = [2, 2, 3, 7, 11, 12, 12];
    const C: [i32; 7] = [1, 1, 5, 7, 9, 13, 14];

    #[test]
    fn test_merge_keeps_duplicates() {
        let merged: Vec<i32> = MergeIterator::new([A.into_iter(), B.into_iter(), C.into_iter()]).collect();
        assert_eq!(merged, vec![1, 1, 1, 2, 2, 3, 4, 5, 6, 6, 7, 7, 7, 9, 11, 12, 12, 12, 13, 14, 15]);
    }

    #[test]
    fn test_unique_merge() {
        let merged: Vec<i32> = MergeIterator::unique([A.into_iter(), B.into_iter(), C.into_iter()]).collect();
        assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 9, 11, 12, 13, 14, 15]);
    }

    proptest! {
        #[test]
        fn prop_merge_is_sorted_union(mut inputs in prop::collection::vec(prop::collection::vec(-50i32..50, 0..20), 0..5)) {
            for input in inputs.iter_mut() {
                input.sort();
            }
            let merged: Vec<i32> = MergeIterator::new(inputs.clone().into_iter().map(|v| v.into_iter())).collect();
            let mut expected: Vec<i32> = inputs.concat();
            expected.sort();
            prop_assert_eq!(&merged, &expected);

            let unique: Vec<i32> = MergeIterator::unique(inputs.into_iter().map(|v| v.into_iter())).collect();
            expected.dedup();
            prop_assert_eq!(unique, expected);
        }
    }

    fn mem(cells: &[Cell]) -> Arc<dyn Fragment> {
        let table = MemoryTable::new("mem");
        table.insert_all(cells.iter().cloned());
        Arc::new(table)
    }

    fn merge_all(chain: Vec<Arc<dyn Fragment>>, pred: ScanPredicate, filter: bool) -> Vec<String> {
        let mut merge = FragmentMerge::new(chain, pred, filter).unwrap();
        let mut out = CellBuffer::new();
        merge.drain(&mut out).unwrap();
        out.cells().iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_newest_fragment_wins() {
        let old = mem(&[Cell::new("a", "c", 1, "old"), Cell::new("b", "c", 1, "b")]);
        let new = mem(&[Cell::new("a", "c", 1, "new"), Cell::new("c", "c", 1, "c")]);
        assert_eq!(merge_all(vec![old, new], ScanPredicate::new(), false), vec!["(a,c,1,new)", "(b,c,1,b)", "(c,c,1,c)"]);
    }

    #[test]
    fn test_erasure_shadows_older_cell() {
        let old = mem(&[Cell::new("a", "c", 1, "v"), Cell::new("a", "c", 0, "older")]);
        let new = mem(&[Cell::erasure("a", "c", 1)]);
        assert_eq!(merge_all(vec![old.clone(), new.clone()], ScanPredicate::new(), true), vec!["(a,c,0,older)"]);
        assert_eq!(
            merge_all(vec![old, new], ScanPredicate::new(), false),
            vec!["(a,c,1,ERASED)", "(a,c,0,older)"]
        );
    }

    #[test]
    fn test_predicate_applies_to_every_input() {
        let one = mem(&[Cell::new("a", "x:1", 1, "a"), Cell::new("m", "y:1", 1, "m")]);
        let two = mem(&[Cell::new("b", "x:2", 1, "b"), Cell::new("z", "x:1", 1, "z")]);
        let pred = ScanPredicate::parse("row < 'n' and column ~= 'x:'").unwrap();
        assert_eq!(merge_all(vec![one, two], pred, false), vec!["(a,x:1,1,a)", "(b,x:2,1,b)"]);
    }

    #[test]
    fn test_batches_resume() {
        let cells: Vec<Cell> = (0..10).map(|i| Cell::new(format!("r{}", i), "c", 1, "v")).collect();
        let one = mem(&cells[..5]);
        let two = mem(&cells[5..]);
        let mut merge = FragmentMerge::new(vec![one, two], ScanPredicate::new(), false).unwrap();
        let mut seen = Vec::new();
        loop {
            let mut out = CellBuffer::new();
            let more = merge.next_batch(&mut out, BatchLimit::new(3, usize::MAX)).unwrap();
            assert!(out.len() <= 3);
            seen.extend(out.into_cells());
            if !more {
                break;
            }
        }
        assert_eq!(seen, cells);
    }

    #[test]
    fn test_history_limit_rejected() {
        assert!(FragmentMerge::new(vec![], ScanPredicate::new().with_max_history(1), false).is_err());
    }
}

//! A view of a fragment limited to some column families.

use crate::error::Result;
use crate::fragment::{BlockReader, CellBlock, Fragment};
use crate::predicate::ScanPredicate;
use crate::tracker::AutoTracker;
use bytes::Bytes;
use std::sync::Arc;

/// Exposes only the cells of `inner` whose column family is in a fixed
/// set, by intersecting every predicate with that set.
#[derive(Debug, Clone)]
pub struct RestrictedFragment {
    inner: Arc<dyn Fragment>,
    families: Vec<Bytes>,
}

impl RestrictedFragment {
    /// Restrict `inner` to `families`.
    pub fn new<I, B>(inner: Arc<dyn Fragment>, families: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut families: Vec<Bytes> = families.into_iter().map(Into::into).collect();
        families.sort();
        families.dedup();
        Self { inner, families }
    }

    /// The allowed families.
    pub fn families(&self) -> &[Bytes] {
        &self.families
    }
}

impl Fragment for RestrictedFragment {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn next_block(&self, pred: &ScanPredicate, min_block: usize) -> Result<Option<usize>> {
        self.inner.next_block(&pred.restrict_families(&self.families), min_block)
    }

    fn load_block(&self, addr: usize) -> Result<Arc<CellBlock>> {
        self.inner.load_block(addr)
    }

    fn load_block_for(&self, addr: usize, pred: &ScanPredicate) -> Result<Arc<CellBlock>> {
        self.inner.load_block_for(addr, &pred.restrict_families(&self.families))
    }

    fn disk_size(&self) -> u64 {
        self.inner.disk_size()
    }

    fn make_reader(&self, block: Arc<CellBlock>, pred: &Arc<ScanPredicate>) -> BlockReader {
        let restricted = Arc::new(pred.restrict_families(&self.families));
        self.inner.make_reader(block, &restricted)
    }

    fn retire(&self, guard: AutoTracker) {
        self.inner.retire(guard);
    }
}

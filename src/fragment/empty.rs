//! Placeholder for a fragment that could not be loaded.

use crate::error::{Error, Result};
use crate::fragment::{CellBlock, Fragment};
use crate::predicate::ScanPredicate;
use std::sync::Arc;

/// A fragment with no blocks, standing in for a missing or unreadable file
/// so the tablet that references it can still be served.
#[derive(Debug, Clone)]
pub struct EmptyFragment {
    uri: String,
}

impl EmptyFragment {
    /// A placeholder for `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl Fragment for EmptyFragment {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_block(&self, _pred: &ScanPredicate, _min_block: usize) -> Result<Option<usize>> {
        Ok(None)
    }

    fn load_block(&self, addr: usize) -> Result<Arc<CellBlock>> {
        Err(Error::invalid_argument(format!("placeholder fragment {} has no block {}", self.uri, addr)))
    }

    fn disk_size(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fragment() {
        let frag = EmptyFragment::new("data/000009.frag");
        assert_eq!(frag.uri(), "data/000009.frag");
        assert_eq!(frag.next_block(&ScanPredicate::new(), 0).unwrap(), None);
        assert!(frag.load_block(0).is_err());
        assert_eq!(frag.disk_size(), 0);
    }
}

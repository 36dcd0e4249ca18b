//! Opening fragments by path with shared caching.

use crate::cache::LoadingCache;
use crate::error::Result;
use crate::fragment::disk::{DiskFragment, IndexCache};
use crate::fragment::{EmptyFragment, Fragment};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opens fragments by path.
pub trait FragmentLoader: Send + Sync {
    /// Open the fragment stored at `path`.
    fn load(&self, path: &Path) -> Result<Arc<dyn Fragment>>;

    /// Open the fragment at `path`, substituting an empty placeholder when
    /// it cannot be read.
    fn load_or_placeholder(&self, path: &Path) -> Arc<dyn Fragment> {
        match self.load(path) {
            Ok(fragment) => fragment,
            Err(e) => {
                log::warn!("Failed to load fragment {}, using empty placeholder: {}", path.display(), e);
                Arc::new(EmptyFragment::new(path.to_string_lossy()))
            }
        }
    }
}

/// Loads disk fragments through a fragment cache and an index cache, so
/// every tablet referencing a file shares one open handle.
#[derive(Debug)]
pub struct CachedFragmentLoader {
    fragments: LoadingCache<PathBuf, DiskFragment>,
    indexes: IndexCache,
}

impl CachedFragmentLoader {
    /// Create a loader with the given cache thresholds.
    pub fn new(fragment_threshold: usize, index_threshold: usize) -> Self {
        Self {
            fragments: LoadingCache::new(fragment_threshold),
            indexes: IndexCache::new(index_threshold),
        }
    }

    /// Drop cached state for `path` so a retired file is not reopened.
    pub fn forget(&self, path: &Path) {
        let key = path.to_path_buf();
        self.fragments.remove(&key);
        self.indexes.remove(&key);
    }

    /// Evict idle entries from both caches.
    pub fn purge(&self) {
        self.fragments.purge();
        self.indexes.purge();
    }

    /// Number of open fragments held by the cache.
    pub fn cached_fragments(&self) -> usize {
        self.fragments.len()
    }
}

impl FragmentLoader for CachedFragmentLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Fragment>> {
        let indexes = &self.indexes;
        let fragment: Arc<dyn Fragment> = self
            .fragments
            .get_or_load(&path.to_path_buf(), |p| DiskFragment::open(p, indexes))?;
        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::config::CompressionType;
    use crate::fragment::{CellOutput, DiskFragmentWriter, FragmentWriter};
    use crate::predicate::ScanPredicate;
    use tempfile::TempDir;

    #[test]
    fn test_shared_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.frag");
        let mut writer = DiskFragmentWriter::create(&path, 1024, CompressionType::None).unwrap();
        writer.emit(&Cell::new("r", "c", 1, "v")).unwrap();
        writer.finish().unwrap();

        let loader = CachedFragmentLoader::new(8, 8);
        let a = loader.load(&path).unwrap();
        let b = loader.load(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.cached_fragments(), 1);

        loader.forget(&path);
        let c = loader.load(&path).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_missing_file_becomes_placeholder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.frag");
        let loader = CachedFragmentLoader::new(8, 8);
        assert!(loader.load(&path).is_err());
        let frag = loader.load_or_placeholder(&path);
        assert_eq!(frag.next_block(&ScanPredicate::new(), 0).unwrap(), None);
        assert_eq!(loader.cached_fragments(), 0);
    }
}

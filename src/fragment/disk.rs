//! Immutable on-disk fragments.
//!
//! File layout:
//! ```text
//! [block 0][trailer] ... [block N][trailer]   // see `block`
//! [index record]                              // see `index`
//! [fragment trailer: 24 bytes]                // see `footer`
//! ```

use crate::cache::LoadingCache;
use crate::error::{Error, Result};
use crate::fragment::block::{decode_block, unseal_block};
use crate::fragment::footer::{Trailer, TRAILER_SIZE};
use crate::fragment::index::FragmentIndex;
use crate::fragment::{CellBlock, Fragment};
use crate::predicate::ScanPredicate;
use crate::tracker::AutoTracker;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cache of decoded block indexes keyed by file path.
pub type IndexCache = LoadingCache<PathBuf, FragmentIndex>;

/// A fragment stored in a single immutable file.
#[derive(Debug)]
pub struct DiskFragment {
    path: PathBuf,
    uri: String,
    file: Mutex<File>,
    file_size: u64,
    index: Arc<FragmentIndex>,
    retired: Mutex<Option<AutoTracker>>,
}

impl DiskFragment {
    /// Open a fragment, reading its index through `indexes`.
    pub fn open(path: &Path, indexes: &IndexCache) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let index = indexes.get_or_load(&path.to_path_buf(), |_| read_index(&mut file, file_size))?;
        log::debug!("Opened fragment {} ({} blocks)", path.display(), index.block_count());
        Ok(Self {
            path: path.to_path_buf(),
            uri: path.to_string_lossy().into_owned(),
            file: Mutex::new(file),
            file_size,
            index,
            retired: Mutex::new(None),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The block index.
    pub fn index(&self) -> &FragmentIndex {
        &self.index
    }

    fn read_stored_block(&self, addr: usize) -> Result<Vec<u8>> {
        let entry = self
            .index
            .entries()
            .get(addr)
            .ok_or_else(|| Error::invalid_argument(format!("block {} out of range in {}", addr, self.uri)))?;
        let handle = entry.handle();
        if handle.end_offset() > self.file_size {
            return Err(Error::corruption(format!("block {} extends past end of {}", addr, self.uri)));
        }
        let mut stored = vec![0u8; handle.size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(handle.offset))?;
        file.read_exact(&mut stored)?;
        Ok(stored)
    }
}

fn read_index(file: &mut File, file_size: u64) -> Result<FragmentIndex> {
    if file_size < TRAILER_SIZE as u64 {
        return Err(Error::corruption("fragment file too small"));
    }
    let mut raw = [0u8; TRAILER_SIZE];
    file.seek(SeekFrom::Start(file_size - TRAILER_SIZE as u64))?;
    file.read_exact(&mut raw)?;
    let trailer = Trailer::decode(&raw, file_size)?;

    let mut data = vec![0u8; trailer.index_handle.size as usize];
    file.seek(SeekFrom::Start(trailer.index_handle.offset))?;
    file.read_exact(&mut data)?;
    FragmentIndex::decode(&data)
}

impl Fragment for DiskFragment {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_block(&self, pred: &ScanPredicate, min_block: usize) -> Result<Option<usize>> {
        Ok(self.index.next_block(pred, min_block))
    }

    fn load_block(&self, addr: usize) -> Result<Arc<CellBlock>> {
        let stored = self.read_stored_block(addr)?;
        let raw: Bytes = unseal_block(&stored)?;
        let cells = decode_block(raw)?;
        Ok(Arc::new(CellBlock::new(cells)))
    }

    fn disk_size(&self) -> u64 {
        self.file_size
    }

    fn retire(&self, guard: AutoTracker) {
        log::debug!("Retiring fragment {}", self.uri);
        *self.retired.lock() = Some(guard);
    }
}

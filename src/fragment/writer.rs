//! Writes disk fragments.

use crate::cell::CellKey;
use crate::config::CompressionType;
use crate::error::{Error, Result};
use crate::fragment::block::{seal_block, BlockBuilder};
use crate::fragment::footer::{BlockHandle, Trailer};
use crate::fragment::index::{FragmentIndex, IndexEntry};
use crate::fragment::{CellOutput, FragmentWriter};
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Streams cells in key order into a new fragment file.
///
/// Blocks are cut once their encoded size reaches the configured block
/// size. Nothing is readable until [`FragmentWriter::finish`] writes the
/// index and trailer; [`DiskFragmentWriter::discard`] abandons the file.
#[derive(Debug)]
pub struct DiskFragmentWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    block: BlockBuilder,
    block_size: usize,
    compression: CompressionType,
    entries: Vec<IndexEntry>,
    offset: u64,
    last_key: Option<CellKey>,
    cell_count: usize,
    data_size: usize,
}

impl DiskFragmentWriter {
    /// Create the file at `path`, which must not exist.
    pub fn create(path: &Path, block_size: usize, compression: CompressionType) -> Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            block: BlockBuilder::new(),
            block_size: block_size.max(1),
            compression,
            entries: Vec::new(),
            offset: 0,
            last_key: None,
            cell_count: 0,
            data_size: 0,
        })
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Abandon the fragment and remove its file.
    pub fn discard(mut self) -> Result<()> {
        self.writer = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn add(&mut self, key: &CellKey, value: Option<&Bytes>) -> Result<()> {
        if self.writer.is_none() {
            return Err(Error::invalid_state("fragment writer already finished"));
        }
        if self.last_key.as_ref().is_some_and(|last| key <= last) {
            return Err(Error::BadOrder);
        }
        self.block.add(key, value)?;
        self.last_key = Some(key.clone());
        self.cell_count += 1;
        self.data_size += key.row().len() + key.column().len() + value.map_or(0, |v| v.len());
        if self.block.current_size() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let builder = std::mem::take(&mut self.block);
        let Some((raw, summary)) = builder.finish() else {
            return Ok(());
        };
        let stored = seal_block(&raw, self.compression)?;
        let writer = self.writer.as_mut().ok_or_else(|| Error::invalid_state("fragment writer closed"))?;
        writer.write_all(&stored)?;
        let handle = BlockHandle::new(self.offset, stored.len() as u64);
        self.offset += stored.len() as u64;
        self.entries.push(IndexEntry::new(&summary, handle));
        Ok(())
    }
}

impl CellOutput for DiskFragmentWriter {
    fn emit_cell(&mut self, key: &CellKey, value: &Bytes) -> Result<()> {
        self.add(key, Some(value))
    }

    fn emit_erasure(&mut self, key: &CellKey) -> Result<()> {
        self.add(key, None)
    }

    fn cell_count(&self) -> usize {
        self.cell_count
    }

    fn data_size(&self) -> usize {
        self.data_size
    }
}

impl FragmentWriter for DiskFragmentWriter {
    fn finish(&mut self) -> Result<u64> {
        self.flush_block()?;
        let index = FragmentIndex::new(std::mem::take(&mut self.entries))?.encode()?;
        let mut writer = self.writer.take().ok_or_else(|| Error::invalid_state("fragment writer already finished"))?;

        let index_handle = BlockHandle::new(self.offset, index.len() as u64);
        writer.write_all(&index)?;
        writer.write_all(&Trailer::new(index_handle).encode())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let size = index_handle.end_offset() + crate::fragment::footer::TRAILER_SIZE as u64;
        log::debug!(
            "Finished fragment {}: {} cells, {} bytes",
            self.path.display(),
            self.cell_count,
            size
        );
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_out_of_order_cells() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            DiskFragmentWriter::create(&dir.path().join("f"), 1024, CompressionType::None).unwrap();
        writer.emit(&Cell::new("b", "c", 1, "v")).unwrap();
        assert!(matches!(writer.emit(&Cell::new("a", "c", 1, "v")), Err(Error::BadOrder)));
        assert!(matches!(writer.emit(&Cell::new("b", "c", 1, "v")), Err(Error::BadOrder)));
    }

    #[test]
    fn test_finish_reports_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.frag");
        let mut writer = DiskFragmentWriter::create(&path, 32, CompressionType::None).unwrap();
        for i in 0..10 {
            writer.emit(&Cell::new(format!("r{}", i), "f:q", 1, "value")).unwrap();
        }
        assert_eq!(writer.cell_count(), 10);
        let size = writer.finish().unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());
        assert!(writer.emit(&Cell::new("z", "f:q", 1, "late")).is_err());
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken");
        std::fs::write(&path, b"x").unwrap();
        assert!(DiskFragmentWriter::create(&path, 1024, CompressionType::None).is_err());
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000002.frag");
        let mut writer = DiskFragmentWriter::create(&path, 1024, CompressionType::None).unwrap();
        writer.emit(&Cell::new("a", "b", 1, "c")).unwrap();
        writer.discard().unwrap();
        assert!(!path.exists());
    }
}

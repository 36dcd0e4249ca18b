//! Commit log writer.

use super::format::{encode_file_header, EntryHeader, FILE_HEADER_SIZE, MAX_DATA_LEN, MAX_NAME_LEN};
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends table-tagged entries to a commit log file.
pub struct CommitLogWriter {
    /// Path to the log file
    path: PathBuf,
    /// Buffered writer for efficient I/O
    writer: BufWriter<File>,
    /// Current file size
    file_size: u64,
}

impl CommitLogWriter {
    /// Open a log for appending, creating it if it doesn't exist.
    ///
    /// The file header is written when the file is empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut file_size = file.metadata()?.len();
        let mut writer = BufWriter::new(file);
        if file_size == 0 {
            writer.write_all(&encode_file_header())?;
            file_size = FILE_HEADER_SIZE as u64;
        }
        Ok(Self { path, writer, file_size })
    }

    /// Open a log for appending after cutting it back to `valid_len` bytes,
    /// dropping a torn entry left by a crash.
    pub fn open_truncated<P: AsRef<Path>>(path: P, valid_len: u64) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path.as_ref())?;
        if file.metadata()?.len() > valid_len {
            log::warn!(
                "Truncating commit log {} to {} bytes",
                path.as_ref().display(),
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);
        Self::open(path)
    }

    /// Append one entry for `table`.
    pub fn append(&mut self, table: &str, data: &[u8]) -> Result<()> {
        if table.len() > MAX_NAME_LEN {
            return Err(Error::invalid_argument(format!("log entry name too long: {} bytes", table.len())));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(Error::invalid_argument(format!("log entry data too long: {} bytes", data.len())));
        }
        let header = EntryHeader::new(table.as_bytes(), data.len());
        self.writer.write_all(&header.encode())?;
        self.writer.write_all(table.as_bytes())?;
        self.writer.write_all(data)?;
        self.file_size += header.entry_size();
        Ok(())
    }

    /// Sync the log to disk
    ///
    /// Ensures all buffered data is written and fsync'd to persistent storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Get the current file size
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the path to the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the writer, flushing all data
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

impl std::fmt::Debug for CommitLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLogWriter")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl Drop for CommitLogWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_log_has_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.log");
        let writer = CommitLogWriter::open(&path).unwrap();
        assert_eq!(writer.file_size(), FILE_HEADER_SIZE as u64);
        writer.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), encode_file_header());
    }

    #[test]
    fn test_append_tracks_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.log");
        let mut writer = CommitLogWriter::open(&path).unwrap();
        writer.append("table1", b"payload").unwrap();
        writer.sync().unwrap();
        let expected = FILE_HEADER_SIZE as u64 + 16 + 6 + 7;
        assert_eq!(writer.file_size(), expected);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.log");
        {
            let mut writer = CommitLogWriter::open(&path).unwrap();
            writer.append("t", b"first").unwrap();
            writer.sync().unwrap();
        }
        let mut writer = CommitLogWriter::open(&path).unwrap();
        let before = writer.file_size();
        writer.append("t", b"second").unwrap();
        assert_eq!(writer.file_size(), before + 16 + 1 + 6);
    }

    #[test]
    fn test_rejects_oversized_name() {
        let dir = TempDir::new().unwrap();
        let mut writer = CommitLogWriter::open(dir.path().join("x.log")).unwrap();
        let name = "n".repeat(MAX_NAME_LEN + 1);
        assert!(writer.append(&name, b"").is_err());
    }
}

//! Commit log readers for recovery.

use super::format::{check_file_header, EntryHeader, ENTRY_HEADER_SIZE, FILE_HEADER_SIZE};
use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::meta::compare_log_names;
use crate::packed::unpack_cells;
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// One recovered log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Table the cells belong to.
    pub table: String,
    /// Packed cell payload.
    pub data: Bytes,
}

impl LogEntry {
    /// Decode the payload.
    pub fn cells(&self) -> Result<Vec<Cell>> {
        unpack_cells(self.data.clone(), false)
    }
}

/// Reads entries from a single log file.
///
/// Reading stops without error at the first entry that is short, has a bad
/// magic number, an oversized length or a bad checksum: a torn tail left
/// by a crash ends the log.
pub struct CommitLogReader {
    reader: BufReader<File>,
    path: PathBuf,
    valid_len: u64,
    done: bool,
}

impl CommitLogReader {
    /// Open a log file and check its header.
    ///
    /// An empty file reads as a log with no entries.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        if len == 0 {
            return Ok(Self { reader, path, valid_len: 0, done: true });
        }
        let mut header = [0u8; FILE_HEADER_SIZE];
        if !read_fully(&mut reader, &mut header)? || !check_file_header(&header) {
            return Err(Error::corruption(format!("bad commit log header in {}", path.display())));
        }
        Ok(Self { reader, path, valid_len: FILE_HEADER_SIZE as u64, done: false })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the prefix made of the header and complete entries read so
    /// far.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Read the next entry, or `None` at the end of the valid log.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        if self.done {
            return Ok(None);
        }
        let entry = self.read_entry()?;
        if entry.is_none() {
            self.done = true;
        }
        Ok(entry)
    }

    fn read_entry(&mut self) -> Result<Option<LogEntry>> {
        let mut raw = [0u8; ENTRY_HEADER_SIZE];
        if !read_fully(&mut self.reader, &mut raw)? {
            return Ok(None);
        }
        let Some(header) = EntryHeader::decode(&raw) else {
            log::warn!("Bad entry header in {} at offset {}", self.path.display(), self.valid_len);
            return Ok(None);
        };
        let mut name = vec![0u8; header.name_len as usize];
        if !read_fully(&mut self.reader, &mut name)? {
            return Ok(None);
        }
        if !header.verify(&name) {
            log::warn!("Bad entry checksum in {} at offset {}", self.path.display(), self.valid_len);
            return Ok(None);
        }
        let mut data = vec![0u8; header.data_len as usize];
        if !read_fully(&mut self.reader, &mut data)? {
            return Ok(None);
        }
        let Ok(table) = String::from_utf8(name) else {
            return Ok(None);
        };
        self.valid_len += header.entry_size();
        Ok(Some(LogEntry { table, data: Bytes::from(data) }))
    }
}

impl Iterator for CommitLogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

// Fill `buf` completely; false on end of file.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// List the `*.log` files of `dir` oldest first, in the order of
/// [`compare_log_names`].
pub fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "log") {
            files.push(path);
        }
    }
    files.sort_by(|a, b| compare_log_names(&file_name(a), &file_name(b)));
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Reads the entries of every log file in a directory, oldest first.
///
/// Files whose header is unreadable are skipped with a warning.
pub struct LogDirReader {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<CommitLogReader>,
    files_read: Vec<PathBuf>,
}

impl LogDirReader {
    /// Read the logs in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self { pending: list_log_files(dir)?.into_iter(), current: None, files_read: Vec::new() })
    }

    /// Files opened so far.
    pub fn files_read(&self) -> &[PathBuf] {
        &self.files_read
    }

    /// Next entry with the file it came from.
    pub fn next_entry(&mut self) -> Result<Option<(PathBuf, LogEntry)>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(entry) = reader.next_entry()? {
                    return Ok(Some((reader.path().to_path_buf(), entry)));
                }
                self.current = None;
            }
            let Some(path) = self.pending.next() else {
                return Ok(None);
            };
            match CommitLogReader::open(&path) {
                Ok(reader) => {
                    log::info!("Replaying commit log {}", path.display());
                    self.files_read.push(path);
                    self.current = Some(reader);
                }
                Err(e) => log::warn!("Skipping commit log {}: {}", path.display(), e),
            }
        }
    }
}

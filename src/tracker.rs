//! Reference counting for files that are deleted once no longer needed.
//!
//! Superseded fragment files and fully serialized log files are tracked
//! here; each holder takes a reference and the file is removed from disk
//! when the last reference is released.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reference counts for files pending deletion.
#[derive(Debug, Default)]
pub struct FileTracker {
    refs: Mutex<HashMap<PathBuf, usize>>,
}

impl FileTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `path` with a single reference.
    pub fn track(&self, path: &Path) -> Result<()> {
        let mut refs = self.refs.lock();
        if refs.contains_key(path) {
            return Err(Error::AlreadyExists(format!("file already tracked: {}", path.display())));
        }
        refs.insert(path.to_path_buf(), 1);
        Ok(())
    }

    /// Stop tracking `path` without deleting it.
    pub fn untrack(&self, path: &Path) -> bool {
        self.refs.lock().remove(path).is_some()
    }

    /// Take another reference to a tracked file.
    pub fn add_reference(&self, path: &Path) -> bool {
        match self.refs.lock().get_mut(path) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference, deleting the file when it was the last one.
    pub fn release(&self, path: &Path) -> Result<()> {
        let delete = {
            let mut refs = self.refs.lock();
            match refs.get_mut(path) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(path);
                    true
                }
                None => {
                    log::warn!("Released untracked file {}", path.display());
                    false
                }
            }
        };
        if delete {
            match fs::remove_file(path) {
                Ok(()) => log::debug!("Deleted unreferenced file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// True if `path` is tracked.
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.refs.lock().contains_key(path)
    }

    /// Current reference count of `path`, zero if untracked.
    pub fn reference_count(&self, path: &Path) -> usize {
        self.refs.lock().get(path).copied().unwrap_or(0)
    }
}

/// Owns one reference to a tracked file and releases it on drop.
#[derive(Debug)]
pub struct AutoTracker {
    tracker: Option<Arc<FileTracker>>,
    path: PathBuf,
}

impl AutoTracker {
    /// Track `path` and hold its first reference.
    pub fn new(tracker: &Arc<FileTracker>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tracker.track(&path)?;
        Ok(Self { tracker: Some(Arc::clone(tracker)), path })
    }

    /// Take an additional reference to an already tracked file.
    pub fn share(tracker: &Arc<FileTracker>, path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        if tracker.add_reference(&path) {
            Some(Self { tracker: Some(Arc::clone(tracker)), path })
        } else {
            None
        }
    }

    /// The guarded file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop tracking the file and leave it on disk. Other guards for the
    /// same file become no-ops.
    pub fn keep(mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.untrack(&self.path);
        }
    }
}

impl Drop for AutoTracker {
    fn drop(&mut self) {
        let Some(tracker) = self.tracker.take() else {
            return;
        };
        if !tracker.is_tracked(&self.path) {
            return;
        }
        if let Err(e) = tracker.release(&self.path) {
            log::error!("Failed to delete {}: {}", self.path.display(), e);
        }
    }
}

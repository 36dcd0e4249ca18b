//! Persistent tablet configuration and file name allocation.
//!
//! A server directory looks like:
//! ```text
//! root/
//!   tablets.json      tablet configs of every table
//!   data/NNNNNN.frag  disk fragments
//!   logs/NNNNNN.log   commit logs
//! ```
//! `tablets.json` is rewritten through a temporary file and a rename, so a
//! crash leaves either the old or the new contents.

use crate::error::{Error, Result};
use crate::interval::Interval;
use crate::name::encode_tablet_name;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "tablets.json";
const DATA_DIR: &str = "data";
const LOG_DIR: &str = "logs";

/// Persisted state of one tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletConfig {
    /// Table the tablet belongs to.
    pub table: String,
    /// Exclusive lower row bound; `None` starts at the first row.
    pub prev_row: Option<Vec<u8>>,
    /// Inclusive upper row bound; `None` runs past the last row.
    pub last_row: Option<Vec<u8>>,
    /// Fragment locations, oldest first.
    pub fragments: Vec<String>,
    /// First commit log holding unserialized mutations of the table.
    #[serde(default)]
    pub log: Option<String>,
}

impl TabletConfig {
    /// A tablet with no fragments.
    pub fn new(table: impl Into<String>, prev_row: Option<Vec<u8>>, last_row: Option<Vec<u8>>) -> Self {
        Self { table: table.into(), prev_row, last_row, fragments: Vec::new(), log: None }
    }

    /// Rows served by the tablet.
    pub fn rows(&self) -> Interval<Bytes> {
        let lower = match &self.prev_row {
            Some(row) => Bound::Excluded(Bytes::from(row.clone())),
            None => Bound::Unbounded,
        };
        let upper = match &self.last_row {
            Some(row) => Bound::Included(Bytes::from(row.clone())),
            None => Bound::Unbounded,
        };
        Interval::new(lower, upper)
    }

    /// Encoded tablet name.
    pub fn name(&self) -> Result<String> {
        Ok(encode_tablet_name(&self.table, self.last_row.as_deref())?)
    }

    /// Config for a tablet serving `rows`, which must have an exclusive or
    /// unbounded lower bound and an inclusive or unbounded upper bound.
    pub fn for_rows(table: impl Into<String>, rows: &Interval<Bytes>) -> Result<Self> {
        let prev_row = match rows.lower() {
            Bound::Excluded(row) => Some(row.to_vec()),
            Bound::Unbounded => None,
            Bound::Included(_) => return Err(Error::invalid_argument("tablet lower bound must be exclusive")),
        };
        let last_row = match rows.upper() {
            Bound::Included(row) => Some(row.to_vec()),
            Bound::Unbounded => None,
            Bound::Excluded(_) => return Err(Error::invalid_argument("tablet upper bound must be inclusive")),
        };
        Ok(Self::new(table, prev_row, last_row))
    }
}

/// Source of tablet configuration and new file names.
pub trait ConfigManager: Send + Sync + fmt::Debug {
    /// Every stored tablet config.
    fn load_tablet_configs(&self) -> Result<Vec<TabletConfig>>;

    /// Replace the stored configs of `table`.
    fn save_table(&self, table: &str, tablets: Vec<TabletConfig>) -> Result<()>;

    /// A fresh path for a disk fragment.
    fn new_data_file(&self) -> Result<PathBuf>;

    /// A fresh path for a commit log.
    fn new_log_file(&self) -> Result<PathBuf>;

    /// Directory holding commit logs.
    fn log_dir(&self) -> PathBuf;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    next_file_number: u64,
    tables: BTreeMap<String, Vec<TabletConfig>>,
}

/// Stores configs as JSON in a server directory.
#[derive(Debug)]
pub struct FileConfigManager {
    root: PathBuf,
    state: Mutex<ConfigFile>,
}

impl FileConfigManager {
    /// Open the server directory at `root`.
    pub fn open(root: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            if !create_if_missing {
                return Err(Error::not_found(format!("server directory {}", root.display())));
            }
            log::info!("Creating server directory {}", root.display());
        }
        fs::create_dir_all(root.join(DATA_DIR))?;
        fs::create_dir_all(root.join(LOG_DIR))?;

        let config_path = root.join(CONFIG_FILE);
        let mut state = if config_path.exists() {
            let text = fs::read_to_string(&config_path)?;
            serde_json::from_str::<ConfigFile>(&text)
                .map_err(|e| Error::corruption(format!("bad {}: {}", config_path.display(), e)))?
        } else {
            ConfigFile::default()
        };

        // Never reuse a number that is on disk or named by a log marker.
        let mut next = state.next_file_number.max(1);
        for dir in [DATA_DIR, LOG_DIR] {
            for entry in fs::read_dir(root.join(dir))? {
                if let Some(n) = file_number(&entry?.path()) {
                    next = next.max(n + 1);
                }
            }
        }
        for config in state.tables.values().flatten() {
            if let Some(n) = config.log.as_deref().and_then(|l| file_number(Path::new(l))) {
                next = next.max(n + 1);
            }
        }
        state.next_file_number = next;
        log::debug!("Opened config in {} (next file {})", root.display(), next);
        Ok(Self { root, state: Mutex::new(state) })
    }

    /// The server directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn allocate(&self, dir: &str, extension: &str) -> Result<PathBuf> {
        let number = {
            let mut state = self.state.lock();
            let n = state.next_file_number;
            state.next_file_number += 1;
            n
        };
        Ok(self.root.join(dir).join(format!("{:06}.{}", number, extension)))
    }

    fn write_config(&self, state: &ConfigFile) -> Result<()> {
        let path = self.root.join(CONFIG_FILE);
        let tmp = self.root.join(format!("{}.tmp", CONFIG_FILE));
        let json = serde_json::to_vec_pretty(state)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl ConfigManager for FileConfigManager {
    fn load_tablet_configs(&self) -> Result<Vec<TabletConfig>> {
        Ok(self.state.lock().tables.values().flatten().cloned().collect())
    }

    fn save_table(&self, table: &str, tablets: Vec<TabletConfig>) -> Result<()> {
        if let Some(bad) = tablets.iter().find(|t| t.table != table) {
            return Err(Error::invalid_argument(format!("tablet of {} saved under {}", bad.table, table)));
        }
        let mut state = self.state.lock();
        state.tables.insert(table.to_string(), tablets);
        self.write_config(&state)
    }

    fn new_data_file(&self) -> Result<PathBuf> {
        self.allocate(DATA_DIR, "frag")
    }

    fn new_log_file(&self) -> Result<PathBuf> {
        self.allocate(LOG_DIR, "log")
    }

    fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }
}

/// The number in an `NNNNNN.ext` file name.
pub fn file_number(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Orders numbered file names by number, which for zero-padded names is
/// length first and then text.
pub fn compare_log_names(a: &str, b: &str) -> Ordering {
    (a.len(), a).cmp(&(b.len(), b))
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rows_round_trip() {
        let config = TabletConfig::new("t", Some(b"a".to_vec()), Some(b"m".to_vec()));
        let rows = config.rows();
        assert!(!rows.contains(&Bytes::from("a")));
        assert!(rows.contains(&Bytes::from("m")));
        assert_eq!(TabletConfig::for_rows("t", &rows).unwrap(), config);
        assert_eq!(config.name().unwrap(), "t m");
        assert_eq!(TabletConfig::new("t", None, None).name().unwrap(), "t!");
        assert!(TabletConfig::for_rows("t", &Interval::at_least(Bytes::from("a"))).is_err());
    }

    #[test]
    fn test_allocates_sequential_names() {
        let dir = TempDir::new().unwrap();
        let config = FileConfigManager::open(dir.path(), true).unwrap();
        let a = config.new_data_file().unwrap();
        let b = config.new_log_file().unwrap();
        assert_eq!(a.file_name().unwrap(), "000001.frag");
        assert_eq!(b.file_name().unwrap(), "000002.log");
        assert_eq!(b.parent().unwrap(), config.log_dir());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let config = FileConfigManager::open(dir.path(), true).unwrap();
            let mut tablet = TabletConfig::new("t", None, None);
            tablet.fragments.push("data/000001.frag".into());
            tablet.log = Some("000007.log".into());
            config.save_table("t", vec![tablet]).unwrap();
            assert!(config.save_table("u", vec![TabletConfig::new("t", None, None)]).is_err());
        }
        let config = FileConfigManager::open(dir.path(), false).unwrap();
        let tablets = config.load_tablet_configs().unwrap();
        assert_eq!(tablets.len(), 1);
        assert_eq!(tablets[0].fragments, vec!["data/000001.frag"]);
        // Numbers named by log markers are not reused.
        assert_eq!(config.new_log_file().unwrap().file_name().unwrap(), "000008.log");
    }

    #[test]
    fn test_skips_existing_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(DATA_DIR)).unwrap();
        fs::write(dir.path().join(DATA_DIR).join("000041.frag"), b"").unwrap();
        let config = FileConfigManager::open(dir.path(), true).unwrap();
        assert_eq!(config.new_data_file().unwrap().file_name().unwrap(), "000042.frag");
    }

    #[test]
    fn test_log_name_order() {
        assert!(compare_log_names("000009.log", "000010.log").is_lt());
        assert!(compare_log_names("999999.log", "1000000.log").is_lt());
        assert!(compare_log_names("000010.log", "000010.log").is_eq());
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        assert!(FileConfigManager::open(dir.path().join("nope"), false).is_err());
    }
}

//! State shared by the server and its background workers.

use crate::compaction::fragdag::FragDag;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::fragment::{CachedFragmentLoader, Fragment};
use crate::meta::{ConfigManager, TabletConfig};
use crate::table::Table;
use crate::tracker::{AutoTracker, FileTracker};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Everything the write, serialize and compaction paths share.
///
/// Changes to fragment stacks are made with `dag` locked: the graph, the
/// table states and the saved configs are updated together under it.
#[derive(Debug)]
pub struct StoreContext {
    /// Server options.
    pub options: Options,
    /// Tablet configuration and file names.
    pub config: Arc<dyn ConfigManager>,
    /// Opens disk fragments.
    pub loader: CachedFragmentLoader,
    /// Reference counts of log files and retired fragments.
    pub tracker: Arc<FileTracker>,
    /// Fragment lineages of every loaded tablet.
    pub dag: Mutex<FragDag>,
    /// Serializes compactions.
    pub compaction_lock: Mutex<()>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Fragments dropped from tables whose config could not be saved
    /// since. Their files stay until a save of the table succeeds.
    unsaved: Mutex<HashMap<String, Vec<Arc<dyn Fragment>>>>,
}

impl StoreContext {
    /// A context with no tables.
    pub fn new(options: Options, config: Arc<dyn ConfigManager>) -> Self {
        let loader = CachedFragmentLoader::new(options.fragment_cache_threshold, options.index_cache_threshold);
        Self {
            options,
            config,
            loader,
            tracker: Arc::new(FileTracker::new()),
            dag: Mutex::new(FragDag::new()),
            compaction_lock: Mutex::new(()),
            tables: RwLock::new(HashMap::new()),
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    /// The loaded table `name`.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotLoaded(name.to_string()))
    }

    /// Every loaded table, in name order.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    /// Register a loaded table.
    pub fn add_table(&self, table: Arc<Table>) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(table.name()) {
            return Err(Error::AlreadyExists(format!("table {}", table.name())));
        }
        tables.insert(table.name().to_string(), table);
        Ok(())
    }

    /// Persist the current tablets of `table`. Call with `dag` locked.
    pub fn save_table_config(&self, table: &Table) -> Result<()> {
        let state = table.state();
        let log = table.log_mark();
        let mut configs = Vec::with_capacity(state.tablets.len());
        for tablet in &state.tablets {
            let mut config = TabletConfig::for_rows(table.name(), &tablet.rows)?;
            config.fragments = tablet.fragments.iter().map(|f| f.fragment.uri().to_string()).collect();
            config.log = log.clone();
            configs.push(config);
        }
        self.config.save_table(table.name(), configs)?;

        let retired = self.unsaved.lock().remove(table.name());
        for fragment in retired.into_iter().flatten() {
            self.retire_fragment(&fragment)?;
        }
        Ok(())
    }

    /// Keep `fragments`, no longer used by `table`, until its config is
    /// next saved. Call with `dag` locked.
    pub fn retire_after_save(&self, table: &str, fragments: Vec<Arc<dyn Fragment>>) {
        if !fragments.is_empty() {
            self.unsaved.lock().entry(table.to_string()).or_default().extend(fragments);
        }
    }

    /// Save every table still holding fragments back from retirement.
    pub fn save_unsaved_tables(&self) -> Result<()> {
        let names: Vec<String> = self.unsaved.lock().keys().cloned().collect();
        for name in names {
            let table = self.table(&name)?;
            let _dag = self.dag.lock();
            self.save_table_config(&table)?;
            log::info!("Saved config of {} after an earlier failure", name);
        }
        Ok(())
    }

    /// Number of fragments waiting for a config save before retirement.
    pub fn unsaved_fragment_count(&self) -> usize {
        self.unsaved.lock().values().map(Vec::len).sum()
    }

    /// Stop caching `fragment` and delete its file once the last reader
    /// drops it.
    pub fn retire_fragment(&self, fragment: &Arc<dyn Fragment>) -> Result<()> {
        let path = Path::new(fragment.uri());
        self.loader.forget(path);
        fragment.retire(AutoTracker::new(&self.tracker, path)?);
        Ok(())
    }
}

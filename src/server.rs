//! The tablet server.

use crate::commitlog::LogDirReader;
use crate::compaction::{run_compaction, CompactionStats};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::fragment::{Fragment, FragmentLoader};
use crate::interval::Interval;
use crate::logger::SharedLogger;
use crate::meta::{compare_log_names, ConfigManager, FileConfigManager, TabletConfig};
use crate::name::validate_table_name;
use crate::predicate::ScanPredicate;
use crate::scanner::{ScanMode, TableScanner};
use crate::store::StoreContext;
use crate::table::{FragmentRef, Table, Tablet};
use crate::worker::{PersistentWorker, WorkerControl};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Serves the tablets of every table in one server directory.
///
/// `TabletServer` is safe to share across threads with `Arc<TabletServer>`.
///
/// # Example
///
/// ```rust,no_run
/// use tabletdb::{Cell, Options, ScanMode, ScanPredicate, TabletServer};
/// use tabletdb::packed::pack_cells;
///
/// # fn main() -> Result<(), tabletdb::Error> {
/// let server = TabletServer::open_dir("./data", Options::default())?;
/// server.create_table("users")?;
///
/// let cells = vec![Cell::new("alice", "info:email", 1, "alice@example.com")];
/// let txn = server.apply("users", pack_cells(&cells), i64::MAX, true)?;
///
/// let mut scanner = server.scan("users", ScanPredicate::new(), ScanMode::AnyTxn)?;
/// let batch = scanner.next_batch(100, 1 << 20)?;
/// assert!(batch.scan_txn >= txn);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TabletServer {
    ctx: Arc<StoreContext>,
    logger: SharedLogger,
    compactor: PersistentWorker,
}

impl TabletServer {
    /// Open a server over the tablets `config` describes.
    ///
    /// Fragments that cannot be read are replaced by empty placeholders.
    /// Mutations left in commit logs are replayed and then serialized.
    pub fn open(config: Arc<dyn ConfigManager>, options: Options) -> Result<Self> {
        options.validate()?;
        let ctx = Arc::new(StoreContext::new(options, config));

        let mut by_table: BTreeMap<String, Vec<TabletConfig>> = BTreeMap::new();
        for tablet in ctx.config.load_tablet_configs()? {
            by_table.entry(tablet.table.clone()).or_default().push(tablet);
        }
        for (name, tablets) in by_table {
            let table = Self::load_table(&ctx, &name, tablets)?;
            ctx.add_table(table)?;
        }

        let (recovered_logs, recovered_tables) = Self::replay_logs(&ctx)?;

        let compactor = PersistentWorker::new("tablet-compact");
        let wake = if ctx.options.background_compaction {
            let worker_ctx = Arc::clone(&ctx);
            compactor.start(Some(ctx.options.compaction_interval), move |control| {
                compact_until_done(&worker_ctx, control);
            })?;
            Some(Arc::clone(compactor.control()))
        } else {
            None
        };
        let logger = SharedLogger::start(Arc::clone(&ctx), wake, recovered_logs, recovered_tables)?;

        log::info!("Tablet server opened with {} tables", ctx.tables().len());
        Ok(Self { ctx, logger, compactor })
    }

    /// Open a server stored in the directory `path`.
    pub fn open_dir(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let config = FileConfigManager::open(path, options.create_if_missing)?;
        Self::open(Arc::new(config), options)
    }

    fn load_table(ctx: &StoreContext, name: &str, configs: Vec<TabletConfig>) -> Result<Arc<Table>> {
        let mut tablets = Vec::with_capacity(configs.len());
        let mut marks = Vec::new();
        {
            let mut dag = ctx.dag.lock();
            for config in configs {
                let rows = config.rows();
                let id = dag.add_tablet(name, rows.clone());
                let mut fragments = Vec::with_capacity(config.fragments.len());
                for uri in &config.fragments {
                    let fragment = ctx.loader.load_or_placeholder(Path::new(uri));
                    let fragment_id = dag.intern_fragment(uri, fragment.disk_size());
                    dag.add_fragment(id, fragment_id)?;
                    fragments.push(FragmentRef { id: fragment_id, fragment });
                }
                let tablet_name = config.name().unwrap_or_else(|e| {
                    log::warn!("Tablet of {} has an unencodable name: {}", name, e);
                    format!("{}!", name)
                });
                marks.extend(config.log);
                tablets.push(Tablet { id, name: tablet_name, rows, fragments });
            }
        }
        let table = Arc::new(Table::new(name, tablets, ctx.options.commit_ring_threshold));
        for mark in marks {
            table.set_log_mark(mark);
        }
        log::debug!("Loaded table {} with {} tablets", name, table.state().tablets.len());
        Ok(table)
    }

    /// Replay the log directory into memory tables, skipping entries a
    /// table has already serialized. Returns the logs read and the tables
    /// that received mutations.
    fn replay_logs(ctx: &StoreContext) -> Result<(Vec<PathBuf>, Vec<Arc<Table>>)> {
        let mut reader = LogDirReader::open(&ctx.config.log_dir())?;
        let mut replayed = BTreeSet::new();
        let mut entries = 0usize;
        while let Some((path, entry)) = reader.next_entry()? {
            let table = match ctx.table(&entry.table) {
                Ok(table) => table,
                Err(_) => {
                    log::warn!("Skipping log entry of unknown table {} in {}", entry.table, path.display());
                    continue;
                }
            };
            if let Some(mark) = table.log_mark() {
                let file = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                if compare_log_names(&file, &mark).is_lt() {
                    continue;
                }
            }
            let cells = match entry.cells() {
                Ok(cells) => cells,
                Err(e) => {
                    log::warn!("Skipping bad log entry of {} in {}: {}", entry.table, path.display(), e);
                    continue;
                }
            };
            table.apply_cells(cells)?;
            replayed.insert(entry.table);
            entries += 1;
        }
        let logs = reader.files_read().to_vec();
        if entries > 0 {
            log::info!("Replayed {} log entries from {} logs", entries, logs.len());
        }
        let tables = replayed.iter().map(|name| ctx.table(name)).collect::<Result<Vec<_>>>()?;
        Ok((logs, tables))
    }

    /// Create an empty table served by a single tablet.
    pub fn create_table(&self, name: &str) -> Result<()> {
        self.create_table_with_splits(name, &[])
    }

    /// Create an empty table whose tablets end at each of `splits`, plus a
    /// last tablet for the rows after them.
    pub fn create_table_with_splits(&self, name: &str, splits: &[Bytes]) -> Result<()> {
        validate_table_name(name)?;
        let mut splits = splits.to_vec();
        splits.sort();
        splits.dedup();

        let mut dag = self.ctx.dag.lock();
        if self.ctx.table(name).is_ok() {
            return Err(Error::AlreadyExists(format!("table {}", name)));
        }
        let mut tablets = Vec::with_capacity(splits.len() + 1);
        let mut lower = Bound::Unbounded;
        for upper in splits.into_iter().map(Bound::Included).chain(std::iter::once(Bound::Unbounded)) {
            let rows = Interval::new(lower, upper.clone());
            let config = TabletConfig::for_rows(name, &rows)?;
            let id = dag.add_tablet(name, rows.clone());
            tablets.push(Tablet { id, name: config.name()?, rows, fragments: Vec::new() });
            lower = match upper {
                Bound::Included(row) => Bound::Excluded(row),
                _ => Bound::Unbounded,
            };
        }
        let table = Arc::new(Table::new(name, tablets, self.ctx.options.commit_ring_threshold));
        self.ctx.save_table_config(&table)?;
        self.ctx.add_table(table)?;
        log::info!("Created table {}", name);
        Ok(())
    }

    /// Names of the loaded tables.
    pub fn table_names(&self) -> Vec<String> {
        self.ctx.tables().iter().map(|t| t.name().to_string()).collect()
    }

    /// The loaded table `name`.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.ctx.table(name)
    }

    /// Commit a packed cell buffer to `table`.
    ///
    /// The mutation fails with [`Error::MutationConflict`] if one of its
    /// rows committed after `max_txn`; pass `i64::MAX` to skip the check.
    /// With `wait_sync` the call returns once the mutation is durable.
    /// Returns the commit transaction.
    pub fn apply(&self, table: &str, packed: Bytes, max_txn: i64, wait_sync: bool) -> Result<i64> {
        let table = self.ctx.table(table)?;
        self.logger.apply(&table, packed, max_txn, wait_sync)
    }

    /// Wait until `wait_txn` is durable. Returns the durable and stable
    /// transactions.
    pub fn sync(&self, wait_txn: i64) -> Result<(i64, i64)> {
        self.logger.sync(wait_txn)
    }

    /// Scan `table` at the last durable transaction.
    pub fn scan(&self, table: &str, pred: ScanPredicate, mode: ScanMode) -> Result<TableScanner> {
        let table = self.ctx.table(table)?;
        TableScanner::new(table, pred, mode, self.logger.last_durable())
    }

    /// Last assigned commit.
    pub fn last_commit(&self) -> i64 {
        self.logger.last_commit()
    }

    /// Highest commit written to the log.
    pub fn last_durable(&self) -> i64 {
        self.logger.last_durable()
    }

    /// Highest commit serialized to a fragment.
    pub fn last_stable(&self) -> i64 {
        self.logger.last_stable()
    }

    /// The write pipeline.
    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    /// Serialize every memory table now and wait for it.
    pub fn serialize_now(&self) -> Result<()> {
        self.logger.serialize_now()
    }

    /// Compact until no tablet has more than one fragment.
    pub fn compact_now(&self) -> Result<Vec<CompactionStats>> {
        let control = WorkerControl::new();
        let mut runs = Vec::new();
        while let Some(stats) = run_compaction(&self.ctx, &control)? {
            let progressed = stats.ranges > 0;
            runs.push(stats);
            if !progressed {
                break;
            }
        }
        Ok(runs)
    }

    /// Number of fragments in use across all tables.
    pub fn fragment_count(&self) -> usize {
        self.ctx.dag.lock().fragment_count()
    }

    /// Stop compaction and the write pipeline. Logs of unserialized
    /// mutations are left for the next open.
    pub fn shutdown(&self) -> Result<()> {
        self.compactor.stop();
        self.compactor.wait()?;
        self.logger.shutdown()?;
        if let Err(e) = self.ctx.save_unsaved_tables() {
            log::error!("Failed to save tables on shutdown: {}", e);
        }
        self.ctx.loader.purge();
        Ok(())
    }
}

impl Drop for TabletServer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Failed to shut down tablet server: {}", e);
        }
    }
}

fn compact_until_done(ctx: &StoreContext, control: &WorkerControl) {
    while !control.is_cancelled() {
        match run_compaction(ctx, control) {
            Ok(Some(stats)) if stats.ranges > 0 => {}
            Ok(_) | Err(Error::Cancelled) => break,
            Err(e) => {
                log::error!("Compaction failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::config::CompressionType;
    use crate::packed::pack_cells;
    use tempfile::TempDir;

    fn options() -> Options {
        Options::new()
            .compression(CompressionType::None)
            .abort_on_log_failure(false)
            .background_compaction(false)
    }

    fn rendered(server: &TabletServer, table: &str) -> Vec<String> {
        server
            .scan(table, ScanPredicate::new(), ScanMode::AnyTxn)
            .unwrap()
            .map(|c| c.unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_create_table_with_splits() {
        let dir = TempDir::new().unwrap();
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table_with_splits("t", &[Bytes::from("m"), Bytes::from("f")]).unwrap();
        let names: Vec<String> = server.table("t").unwrap().state().tablets.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["t f", "t m", "t!"]);
        assert!(matches!(server.create_table("t"), Err(Error::AlreadyExists(_))));
        assert!(server.create_table("bad name").is_err());
    }

    #[test]
    fn test_apply_and_scan() {
        let dir = TempDir::new().unwrap();
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table_with_splits("t", &[Bytes::from("m")]).unwrap();
        let cells = vec![Cell::new("a", "c", 1, "1"), Cell::new("z", "c", 1, "2")];
        let txn = server.apply("t", pack_cells(&cells), i64::MAX, true).unwrap();
        assert_eq!(txn, 1);
        assert_eq!(rendered(&server, "t"), vec!["(a,c,1,1)", "(z,c,1,2)"]);
        assert!(server.apply("nope", pack_cells(&cells), i64::MAX, true).unwrap_err().is_not_loaded());
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        {
            let server = TabletServer::open_dir(dir.path(), options()).unwrap();
            server.create_table("t").unwrap();
            server.apply("t", pack_cells(&[Cell::new("a", "c", 1, "1")]), i64::MAX, true).unwrap();
            server.apply("t", pack_cells(&[Cell::erasure("a", "c", 1)]), i64::MAX, false).unwrap();
            server.apply("t", pack_cells(&[Cell::new("b", "c", 1, "2")]), i64::MAX, true).unwrap();
        }
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        assert_eq!(rendered(&server, "t"), vec!["(b,c,1,2)"]);
        // Replayed data is serialized on open.
        server.serialize_now().unwrap();
        assert_eq!(server.fragment_count(), 1);
        assert_eq!(rendered(&server, "t"), vec!["(b,c,1,2)"]);
    }

    #[test]
    fn test_serialize_and_compact() {
        let dir = TempDir::new().unwrap();
        let server = TabletServer::open_dir(dir.path(), options()).unwrap();
        server.create_table("t").unwrap();
        for i in 0..3 {
            let cell = Cell::new(format!("r{}", i), "c", 1, "v");
            server.apply("t", pack_cells(&[cell]), i64::MAX, true).unwrap();
            server.serialize_now().unwrap();
        }
        assert_eq!(server.fragment_count(), 3);
        assert_eq!(server.last_stable(), 3);

        let runs = server.compact_now().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].retired, 3);
        assert_eq!(server.fragment_count(), 1);
        assert_eq!(rendered(&server, "t"), vec!["(r0,c,1,v)", "(r1,c,1,v)", "(r2,c,1,v)"]);
    }
}

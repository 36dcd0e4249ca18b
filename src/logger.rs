//! The shared write pipeline.
//!
//! Every table on a server logs through one [`SharedLogger`]:
//!
//! 1. `apply` checks a mutation against the table's row commits, assigns
//!    it a transaction and adds it to the commit buffer
//! 2. Full buffers, and buffers left idle for the flush interval, go to the
//!    commit worker, which writes them to the log with a single sync and
//!    then applies them to memory tables; their transactions are durable
//! 3. Once the log passes the serialize threshold the commit worker starts
//!    a new log, freezes the memory table of every table written to the old
//!    one and hands those to the serialize worker
//! 4. The serialize worker writes frozen memory tables to fragments. When
//!    every table of a log is on disk the log file is released and its
//!    transactions are stable
//!
//! A log file is reference counted: the active writer holds one reference
//! and each frozen memory table holds one until it is serialized. On
//! shutdown the remaining references are kept rather than released, so
//! logs with unserialized mutations stay on disk for recovery.

use crate::cell::Cell;
use crate::commitlog::format::MAX_DATA_LEN;
use crate::commitlog::CommitLogWriter;
use crate::compaction::serialize_memtable;
use crate::error::{Error, Result};
use crate::memtable::MemoryTable;
use crate::packed::unpack_cells;
use crate::store::StoreContext;
use crate::table::Table;
use crate::tracker::AutoTracker;
use crate::txn::{TransactionCounter, TxnCallback};
use crate::worker::{PersistentWorker, QueuedWorker, WorkerControl};
use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Batches handed to the commit worker at once.
const MAX_COMMIT_BATCH: usize = 64;
/// Jobs handed to the serialize worker at once.
const MAX_SERIALIZE_BATCH: usize = 16;
/// How often a blocked `sync` re-checks for a log failure.
const SYNC_POLL: Duration = Duration::from_millis(100);

type Reply = Sender<Result<()>>;

/// One table's mutation, packed for the log and unpacked for the memory
/// table.
struct LogItem {
    table: Arc<Table>,
    packed: Bytes,
    cells: Vec<Cell>,
}

#[derive(Default)]
struct CommitBuffer {
    entries: Vec<LogItem>,
    size: usize,
    max_txn: i64,
}

impl CommitBuffer {
    fn take(&mut self) -> CommitBatch {
        self.size = 0;
        CommitBatch { entries: std::mem::take(&mut self.entries), max_txn: self.max_txn }
    }
}

struct CommitBatch {
    entries: Vec<LogItem>,
    max_txn: i64,
}

enum CommitItem {
    Batch(CommitBatch),
    /// Start a new log now; the reply fires once the old one is serialized.
    Roll(Option<Reply>),
}

/// Tables of one closed log still waiting to be serialized.
#[derive(Debug)]
struct LogGroup {
    remaining: AtomicUsize,
    max_txn: i64,
}

struct SerializeJob {
    table: Arc<Table>,
    memtable: Arc<MemoryTable>,
    logs: Vec<AutoTracker>,
    mark: String,
    group: Arc<LogGroup>,
}

enum SerializeItem {
    Job(SerializeJob),
    Barrier(Reply),
}

/// State shared by callers and both workers.
struct LoggerShared {
    buffer: Mutex<CommitBuffer>,
    counter: Mutex<TransactionCounter>,
    watermark: Condvar,
    failure: Mutex<Option<String>>,
    groups: Mutex<VecDeque<Arc<LogGroup>>>,
}

impl LoggerShared {
    fn check_failure(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(msg) => Err(Error::invalid_state(format!("commit log failed: {}", msg))),
            None => Ok(()),
        }
    }

    fn fail(&self, msg: String) {
        *self.failure.lock() = Some(msg);
        let _counter = self.counter.lock();
        self.watermark.notify_all();
    }

    fn advance_durable(&self, txn: i64) {
        let callbacks = {
            let mut counter = self.counter.lock();
            if txn <= counter.last_durable() {
                return;
            }
            let callbacks = counter.set_last_durable(txn);
            self.watermark.notify_all();
            callbacks
        };
        match callbacks {
            Ok(Some(callbacks)) => callbacks.run(),
            Ok(None) => {}
            Err(e) => log::error!("Failed to advance durable txn: {}", e),
        }
    }

    /// Pop every finished group at the front and mark its transactions
    /// stable.
    fn advance_stable(&self) {
        let target = {
            let mut groups = self.groups.lock();
            let mut target = None;
            while groups.front().is_some_and(|g| g.remaining.load(Ordering::SeqCst) == 0) {
                target = groups.pop_front().map(|g| g.max_txn);
            }
            target
        };
        let Some(txn) = target else {
            return;
        };
        let callbacks = {
            let mut counter = self.counter.lock();
            if txn <= counter.last_stable() {
                return;
            }
            let callbacks = counter.set_last_stable(txn);
            self.watermark.notify_all();
            callbacks
        };
        match callbacks {
            Ok(Some(callbacks)) => callbacks.run(),
            Ok(None) => {}
            Err(e) => log::error!("Failed to advance stable txn: {}", e),
        }
    }
}

/// Move the commit buffer to the commit worker. The buffer lock is held
/// while queueing so batches reach the log in transaction order.
fn flush_buffer(shared: &LoggerShared, commit: &QueuedWorker<CommitItem>) -> Result<()> {
    let mut buffer = shared.buffer.lock();
    if buffer.entries.is_empty() {
        return Ok(());
    }
    let batch = buffer.take();
    commit.submit(CommitItem::Batch(batch))
}

fn log_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn open_log(ctx: &StoreContext) -> Result<(CommitLogWriter, AutoTracker)> {
    let path = ctx.config.new_log_file()?;
    let writer = CommitLogWriter::open(&path)?;
    let guard = AutoTracker::new(&ctx.tracker, &path)?;
    log::info!("Opened commit log {}", path.display());
    Ok((writer, guard))
}

/// The commit worker's log.
struct LogState {
    ctx: Arc<StoreContext>,
    shared: Arc<LoggerShared>,
    serialize: Arc<QueuedWorker<SerializeItem>>,
    writer: CommitLogWriter,
    guard: Option<AutoTracker>,
    /// Tables with entries in the current log, each holding a reference.
    tables: BTreeMap<String, (Arc<Table>, Option<AutoTracker>)>,
    max_txn: i64,
}

impl LogState {
    fn handle(&mut self, items: Vec<CommitItem>) {
        let mut pending = Vec::new();
        for item in items {
            match item {
                CommitItem::Batch(batch) => pending.push(batch),
                CommitItem::Roll(reply) => {
                    let batches = std::mem::take(&mut pending);
                    match self.write(batches).and_then(|()| self.roll()) {
                        Ok(()) => {
                            if let Some(reply) = reply {
                                // A refused barrier drops the reply, which the
                                // waiter sees as a stopped logger.
                                let _ = self.serialize.submit(SerializeItem::Barrier(reply));
                            }
                        }
                        Err(e) => {
                            let msg = e.to_string();
                            self.failed(e);
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(Error::invalid_state(msg)));
                            }
                        }
                    }
                }
            }
        }
        let threshold = self.ctx.options.serialize_threshold;
        let result = self.write(pending).and_then(|()| {
            if !self.tables.is_empty() && self.writer.file_size() >= threshold {
                self.roll()
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            self.failed(e);
        }
    }

    /// Log the batches with one sync, then apply them.
    fn write(&mut self, batches: Vec<CommitBatch>) -> Result<()> {
        let Some(max_txn) = batches.last().map(|b| b.max_txn) else {
            return Ok(());
        };
        self.shared.check_failure()?;
        for batch in &batches {
            for item in &batch.entries {
                self.writer.append(item.table.name(), &item.packed)?;
                if !self.tables.contains_key(item.table.name()) {
                    let share = AutoTracker::share(&self.ctx.tracker, self.writer.path());
                    self.tables.insert(item.table.name().to_string(), (Arc::clone(&item.table), share));
                }
            }
        }
        self.writer.sync()?;
        for batch in batches {
            for item in batch.entries {
                item.table.apply_cells(item.cells)?;
            }
        }
        self.max_txn = max_txn;
        self.shared.advance_durable(max_txn);
        Ok(())
    }

    /// Switch to a new log and queue the tables of the old one for
    /// serialization.
    fn roll(&mut self) -> Result<()> {
        let (writer, guard) = open_log(&self.ctx)?;
        let mark = log_name(writer.path());
        let old_writer = std::mem::replace(&mut self.writer, writer);
        let old_guard = std::mem::replace(&mut self.guard, Some(guard));
        let tables = std::mem::take(&mut self.tables);
        let group = Arc::new(LogGroup { remaining: AtomicUsize::new(tables.len()), max_txn: self.max_txn });
        self.shared.groups.lock().push_back(Arc::clone(&group));
        log::info!(
            "Rolled commit log {} to {}, serializing {} tables",
            old_writer.path().display(),
            mark,
            tables.len()
        );

        if let Err(e) = self.hand_off(tables, &mark, &group) {
            if let Some(old_guard) = old_guard {
                old_guard.keep();
            }
            return Err(e);
        }
        old_writer.close()?;
        drop(old_guard);
        self.shared.advance_stable();
        Ok(())
    }

    fn hand_off(
        &self,
        tables: BTreeMap<String, (Arc<Table>, Option<AutoTracker>)>,
        mark: &str,
        group: &Arc<LogGroup>,
    ) -> Result<()> {
        for (_, (table, share)) in tables {
            let memtable = table.freeze_memtable()?;
            self.serialize.submit(SerializeItem::Job(SerializeJob {
                table,
                memtable,
                logs: share.into_iter().collect(),
                mark: mark.to_string(),
                group: Arc::clone(group),
            }))?;
        }
        Ok(())
    }

    fn failed(&self, e: Error) {
        if self.ctx.options.abort_on_log_failure {
            log::error!("Commit log {} failed, aborting: {}", self.writer.path().display(), e);
            std::process::abort();
        }
        log::error!("Commit log {} failed: {}", self.writer.path().display(), e);
        self.shared.fail(e.to_string());
    }
}

impl Drop for LogState {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.keep();
        }
        for (_, (_, share)) in std::mem::take(&mut self.tables) {
            if let Some(share) = share {
                share.keep();
            }
        }
    }
}

/// The serialize worker's queue of frozen memory tables.
struct SerializeState {
    ctx: Arc<StoreContext>,
    shared: Arc<LoggerShared>,
    compaction: Option<Arc<WorkerControl>>,
    /// Jobs not yet done, in arrival order.
    pending: Vec<SerializeJob>,
}

impl SerializeState {
    fn handle(&mut self, items: Vec<SerializeItem>, control: &WorkerControl) {
        if items.is_empty() && self.pending.is_empty() {
            return;
        }
        let mut barriers = Vec::new();
        for item in items {
            match item {
                SerializeItem::Job(job) => self.pending.push(job),
                SerializeItem::Barrier(reply) => barriers.push(reply),
            }
        }
        self.run(control);
        for reply in barriers {
            let result = if self.pending.is_empty() {
                Ok(())
            } else {
                Err(Error::invalid_state(format!(
                    "{} memory tables could not be serialized",
                    self.pending.len()
                )))
            };
            let _ = reply.send(result);
        }
    }

    /// Serialize pending jobs. A failed job blocks later jobs of the same
    /// table so that its memory tables reach disk in order; they are all
    /// retried on the next round, which comes with the next queued item or
    /// after `serialize_retry_interval` without one.
    fn run(&mut self, control: &WorkerControl) {
        let mut blocked = HashSet::new();
        let mut done = 0;
        for job in std::mem::take(&mut self.pending) {
            if blocked.contains(job.table.name()) {
                self.pending.push(job);
                continue;
            }
            match serialize_memtable(&self.ctx, &job.table, &job.memtable, Some(&job.mark), control) {
                Ok(_) => {
                    job.group.remaining.fetch_sub(1, Ordering::SeqCst);
                    done += 1;
                }
                Err(e) => {
                    if !matches!(e, Error::Cancelled) {
                        log::error!("Failed to serialize {}: {}", job.table.name(), e);
                    }
                    blocked.insert(job.table.name().to_string());
                    self.pending.push(job);
                }
            }
        }
        if done > 0 {
            self.shared.advance_stable();
            if let Some(compaction) = &self.compaction {
                compaction.wake();
            }
        }
    }
}

impl Drop for SerializeState {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!("Keeping logs of {} unserialized memory tables", self.pending.len());
        }
        for job in self.pending.drain(..) {
            for log in job.logs {
                log.keep();
            }
        }
    }
}

/// Commit log, commit buffer and serialization shared by every table of a
/// server.
pub struct SharedLogger {
    ctx: Arc<StoreContext>,
    shared: Arc<LoggerShared>,
    commit: Arc<QueuedWorker<CommitItem>>,
    serialize: Arc<QueuedWorker<SerializeItem>>,
    flusher: PersistentWorker,
}

impl std::fmt::Debug for SharedLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counter = self.shared.counter.lock();
        f.debug_struct("SharedLogger")
            .field("last_commit", &counter.last_commit())
            .field("last_durable", &counter.last_durable())
            .field("last_stable", &counter.last_stable())
            .finish()
    }
}

impl SharedLogger {
    /// Open a new log and start the workers.
    ///
    /// `recovered_tables` hold mutations replayed from `recovered_logs`;
    /// their memory tables are serialized right away and the logs are
    /// deleted once that is done. `compaction` is woken whenever new
    /// fragments appear.
    pub fn start(
        ctx: Arc<StoreContext>,
        compaction: Option<Arc<WorkerControl>>,
        recovered_logs: Vec<PathBuf>,
        recovered_tables: Vec<Arc<Table>>,
    ) -> Result<Self> {
        let shared = Arc::new(LoggerShared {
            buffer: Mutex::new(CommitBuffer::default()),
            counter: Mutex::new(TransactionCounter::new()),
            watermark: Condvar::new(),
            failure: Mutex::new(None),
            groups: Mutex::new(VecDeque::new()),
        });

        let mut serialize_state =
            SerializeState { ctx: Arc::clone(&ctx), shared: Arc::clone(&shared), compaction, pending: Vec::new() };
        let serialize = Arc::new(QueuedWorker::start_with_idle(
            "tablet-serialize",
            ctx.options.serialize_queue_depth,
            MAX_SERIALIZE_BATCH,
            Some(ctx.options.serialize_retry_interval),
            move |items, control| serialize_state.handle(items, control),
        )?);

        let (writer, guard) = open_log(&ctx)?;
        let mark = log_name(writer.path());
        let mut log_state = LogState {
            ctx: Arc::clone(&ctx),
            shared: Arc::clone(&shared),
            serialize: Arc::clone(&serialize),
            writer,
            guard: Some(guard),
            tables: BTreeMap::new(),
            max_txn: 0,
        };
        Self::serialize_recovered(&ctx, &shared, &serialize, &mark, recovered_logs, recovered_tables)?;

        let commit = Arc::new(QueuedWorker::start(
            "tablet-commit",
            ctx.options.commit_queue_depth,
            MAX_COMMIT_BATCH,
            move |items, _| log_state.handle(items),
        )?);

        let flusher = PersistentWorker::new("tablet-flush");
        {
            let shared = Arc::clone(&shared);
            let commit = Arc::clone(&commit);
            flusher.start(Some(ctx.options.commit_flush_interval), move |_| {
                if let Err(e) = flush_buffer(&shared, &commit) {
                    log::warn!("Failed to flush commit buffer: {}", e);
                }
            })?;
        }

        Ok(Self { ctx, shared, commit, serialize, flusher })
    }

    fn serialize_recovered(
        ctx: &StoreContext,
        shared: &LoggerShared,
        serialize: &QueuedWorker<SerializeItem>,
        mark: &str,
        logs: Vec<PathBuf>,
        tables: Vec<Arc<Table>>,
    ) -> Result<()> {
        let mut guards = Vec::with_capacity(logs.len());
        for path in &logs {
            guards.push(AutoTracker::new(&ctx.tracker, path)?);
        }
        let mut jobs = Vec::new();
        for table in tables {
            if table.active_memtable()?.is_empty() {
                continue;
            }
            let memtable = table.freeze_memtable()?;
            jobs.push((table, memtable));
        }
        if jobs.is_empty() {
            // Nothing replayed, so the logs hold nothing still needed.
            drop(guards);
            return Ok(());
        }
        log::info!("Serializing {} tables recovered from {} logs", jobs.len(), logs.len());

        let group = Arc::new(LogGroup { remaining: AtomicUsize::new(jobs.len()), max_txn: 0 });
        shared.groups.lock().push_back(Arc::clone(&group));
        for (table, memtable) in jobs {
            let shares = guards.iter().filter_map(|g| AutoTracker::share(&ctx.tracker, g.path())).collect();
            serialize.submit(SerializeItem::Job(SerializeJob {
                table,
                memtable,
                logs: shares,
                mark: mark.to_string(),
                group: Arc::clone(&group),
            }))?;
        }
        Ok(())
    }

    /// Commit packed cells to `table`.
    ///
    /// Fails with [`Error::MutationConflict`] if any row of the mutation
    /// committed after `max_txn`. With `wait_sync` the call returns once
    /// the mutation is durable. Returns the commit transaction, or the last
    /// commit if there were no cells.
    pub fn apply(&self, table: &Arc<Table>, packed: Bytes, max_txn: i64, wait_sync: bool) -> Result<i64> {
        self.shared.check_failure()?;
        if packed.len() > MAX_DATA_LEN {
            return Err(Error::invalid_argument(format!("mutation too large: {} bytes", packed.len())));
        }
        let cells = unpack_cells(packed.clone(), true)?;
        if cells.is_empty() {
            return Ok(self.last_commit());
        }
        let mut rows: Vec<Bytes> = cells.iter().map(|c| c.row().clone()).collect();
        rows.dedup();
        table.verify_tablets_loaded(&rows)?;

        let txn = {
            let mut buffer = self.shared.buffer.lock();
            table.verify_commit_applies(&rows, max_txn)?;
            let txn = self.shared.counter.lock().assign_commit();
            table.update_row_commits(&rows, txn)?;
            buffer.size += packed.len();
            buffer.max_txn = txn;
            buffer.entries.push(LogItem { table: Arc::clone(table), packed, cells });
            if buffer.size >= self.ctx.options.commit_buffer_size {
                let batch = buffer.take();
                self.commit.submit(CommitItem::Batch(batch))?;
            }
            txn
        };
        log::trace!("Committed txn {} to {}", txn, table.name());

        if wait_sync {
            self.sync(txn)?;
        }
        Ok(txn)
    }

    /// Block until `wait_txn`, or the last commit if that is lower, is
    /// durable. Returns the durable and stable transactions.
    pub fn sync(&self, wait_txn: i64) -> Result<(i64, i64)> {
        let wait = {
            let counter = self.shared.counter.lock();
            let wait = wait_txn.min(counter.last_commit());
            if counter.last_durable() >= wait {
                return Ok((counter.last_durable(), counter.last_stable()));
            }
            wait
        };
        flush_buffer(&self.shared, &self.commit)?;
        let mut counter = self.shared.counter.lock();
        while counter.last_durable() < wait {
            self.shared.check_failure()?;
            self.shared.watermark.wait_for(&mut counter, SYNC_POLL);
        }
        Ok((counter.last_durable(), counter.last_stable()))
    }

    /// Hand the commit buffer to the log without waiting.
    pub fn flush(&self) -> Result<()> {
        flush_buffer(&self.shared, &self.commit)
    }

    /// Roll the log now and wait until every memory table written so far
    /// is serialized.
    pub fn serialize_now(&self) -> Result<()> {
        self.flush()?;
        let (reply, done) = channel::bounded(1);
        self.commit.submit(CommitItem::Roll(Some(reply)))?;
        done.recv()
            .map_err(|_| Error::invalid_state("logger stopped before serializing"))?
    }

    /// Last assigned commit.
    pub fn last_commit(&self) -> i64 {
        self.shared.counter.lock().last_commit()
    }

    /// Highest commit written to the log.
    pub fn last_durable(&self) -> i64 {
        self.shared.counter.lock().last_durable()
    }

    /// Highest commit serialized to a fragment.
    pub fn last_stable(&self) -> i64 {
        self.shared.counter.lock().last_stable()
    }

    /// Run `callback` on a worker thread once `wait_txn` is durable.
    pub fn defer_until_durable(&self, callback: TxnCallback, wait_txn: i64) -> Result<()> {
        self.shared.counter.lock().defer_until_durable(callback, wait_txn)
    }

    /// Run `callback` on a worker thread once `wait_txn` is stable.
    pub fn defer_until_stable(&self, callback: TxnCallback, wait_txn: i64) -> Result<()> {
        self.shared.counter.lock().defer_until_stable(callback, wait_txn)
    }

    /// Write out the commit buffer and stop the workers. Queued memory
    /// tables are still serialized; logs of anything left unserialized
    /// stay on disk.
    pub fn shutdown(&self) -> Result<()> {
        self.flusher.stop();
        self.flusher.wait()?;
        let flushed = self.flush();
        self.commit.stop();
        self.commit.wait()?;
        self.serialize.stop();
        self.serialize.wait()?;
        flushed
    }
}

impl Drop for SharedLogger {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Failed to shut down logger: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{list_log_files, LogDirReader};
    use crate::config::{CompressionType, Options};
    use crate::interval::Interval;
    use crate::meta::{ConfigManager, FileConfigManager};
    use crate::packed::pack_cells;
    use crate::table::Tablet;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<StoreContext>, Arc<Table>) {
        let config: Arc<dyn ConfigManager> = Arc::new(FileConfigManager::open(dir.path(), true).unwrap());
        let options = Options::new().compression(CompressionType::None).abort_on_log_failure(false);
        let ctx = Arc::new(StoreContext::new(options, config));
        let id = ctx.dag.lock().add_tablet("t", Interval::all());
        let tablet = Tablet { id, name: "t!".into(), rows: Interval::all(), fragments: Vec::new() };
        let table = Arc::new(Table::new("t", vec![tablet], 1024));
        ctx.add_table(Arc::clone(&table)).unwrap();
        (ctx, table)
    }

    fn packed(cells: &[Cell]) -> Bytes {
        pack_cells(cells)
    }

    #[test]
    fn test_apply_and_sync() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let logger = SharedLogger::start(ctx, None, Vec::new(), Vec::new()).unwrap();

        let txn = logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, false).unwrap();
        assert_eq!(txn, 1);
        let (durable, stable) = logger.sync(txn).unwrap();
        assert_eq!(durable, 1);
        assert_eq!(stable, 0);
        assert_eq!(table.active_memtable().unwrap().len(), 1);
        assert_eq!(table.row_commit(b"a"), 1);

        let txn = logger.apply(&table, packed(&[Cell::new("b", "c", 1, "v")]), i64::MAX, true).unwrap();
        assert_eq!(txn, 2);
        assert_eq!(logger.last_durable(), 2);
    }

    #[test]
    fn test_empty_mutation_returns_last_commit() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let logger = SharedLogger::start(ctx, None, Vec::new(), Vec::new()).unwrap();
        logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, false).unwrap();
        assert_eq!(logger.apply(&table, packed(&[]), i64::MAX, false).unwrap(), 1);
    }

    #[test]
    fn test_conflicting_mutation_rejected() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let logger = SharedLogger::start(ctx, None, Vec::new(), Vec::new()).unwrap();
        logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, true).unwrap();

        let err = logger.apply(&table, packed(&[Cell::new("a", "c", 2, "w")]), 0, false).unwrap_err();
        assert!(err.is_transaction_conflict());
        assert_eq!(logger.last_commit(), 1);
        // Up to date callers get through.
        assert_eq!(logger.apply(&table, packed(&[Cell::new("a", "c", 2, "w")]), 1, false).unwrap(), 2);
    }

    #[test]
    fn test_corrupt_mutation_rejected() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let logger = SharedLogger::start(ctx, None, Vec::new(), Vec::new()).unwrap();
        let mut data = packed(&[Cell::new("a", "c", 1, "v")]).to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let err = logger.apply(&table, Bytes::from(data), i64::MAX, false).unwrap_err();
        assert!(err.is_cell_data_error());
        assert_eq!(logger.last_commit(), 0);
    }

    #[test]
    fn test_serialize_now_releases_log() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let logger = SharedLogger::start(Arc::clone(&ctx), None, Vec::new(), Vec::new()).unwrap();
        let log_dir = ctx.config.log_dir();
        let first = list_log_files(&log_dir).unwrap();
        assert_eq!(first.len(), 1);

        logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, true).unwrap();
        logger.serialize_now().unwrap();

        let logs = list_log_files(&log_dir).unwrap();
        assert_eq!(logs.len(), 1);
        assert_ne!(logs, first);
        assert_eq!(logger.last_stable(), 1);
        assert_eq!(table.log_mark(), Some(log_name(&logs[0])));
        let state = table.state();
        assert_eq!(state.tablets[0].fragments.len(), 1);
        assert_eq!(state.memtables.len(), 1);
        assert!(state.memtables[0].is_empty());
    }

    #[test]
    fn test_stable_callback_fires_after_serialize() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let logger = SharedLogger::start(ctx, None, Vec::new(), Vec::new()).unwrap();
        let txn = logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, true).unwrap();

        let (tx, rx) = channel::unbounded();
        logger
            .defer_until_stable(
                Box::new(move |wait, last| {
                    let _ = tx.send((wait, last));
                }),
                txn,
            )
            .unwrap();
        assert!(rx.try_recv().is_err());
        logger.serialize_now().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (1, 1));
        // Already stable.
        assert!(logger.defer_until_stable(Box::new(|_, _| {}), txn).is_err());
    }

    #[test]
    fn test_shutdown_keeps_unserialized_log() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let log_dir = ctx.config.log_dir();
        {
            let logger = SharedLogger::start(Arc::clone(&ctx), None, Vec::new(), Vec::new()).unwrap();
            logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, false).unwrap();
            logger.apply(&table, packed(&[Cell::erasure("b", "c", 1)]), i64::MAX, false).unwrap();
            logger.shutdown().unwrap();
        }
        let mut reader = LogDirReader::open(&log_dir).unwrap();
        let mut cells = Vec::new();
        while let Some((_, entry)) = reader.next_entry().unwrap() {
            assert_eq!(entry.table, "t");
            cells.extend(entry.cells().unwrap());
        }
        let rendered: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        assert_eq!(rendered, vec!["(a,c,1,v)", "(b,c,1,ERASED)"]);
    }

    #[test]
    fn test_roll_at_threshold() {
        let dir = TempDir::new().unwrap();
        let config: Arc<dyn ConfigManager> = Arc::new(FileConfigManager::open(dir.path(), true).unwrap());
        let options = Options::new().compression(CompressionType::None).serialize_threshold(1);
        let ctx = Arc::new(StoreContext::new(options, config));
        let id = ctx.dag.lock().add_tablet("t", Interval::all());
        let table = Arc::new(Table::new(
            "t",
            vec![Tablet { id, name: "t!".into(), rows: Interval::all(), fragments: Vec::new() }],
            1024,
        ));
        ctx.add_table(Arc::clone(&table)).unwrap();
        let logger = SharedLogger::start(Arc::clone(&ctx), None, Vec::new(), Vec::new()).unwrap();

        let txn = logger.apply(&table, packed(&[Cell::new("a", "c", 1, "v")]), i64::MAX, true).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while logger.last_stable() < txn && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(logger.last_stable(), txn);
        assert_eq!(ctx.dag.lock().fragment_count(), 1);
    }

    #[test]
    fn test_recovered_tables_are_serialized() {
        let dir = TempDir::new().unwrap();
        let (ctx, table) = setup(&dir);
        let old_log = ctx.config.new_log_file().unwrap();
        {
            let mut writer = CommitLogWriter::open(&old_log).unwrap();
            writer.append("t", &packed(&[Cell::new("a", "c", 1, "v")])).unwrap();
            writer.close().unwrap();
        }
        table.apply_cells(vec![Cell::new("a", "c", 1, "v")]).unwrap();

        let logger = SharedLogger::start(Arc::clone(&ctx), None, vec![old_log.clone()], vec![Arc::clone(&table)]).unwrap();
        logger.shutdown().unwrap();
        assert!(!old_log.exists());
        assert_eq!(table.state().tablets[0].fragments.len(), 1);
        assert!(table.log_mark().is_some());
    }
}

//! Tables and their tablets.
//!
//! A [`Table`] owns the fragment stacks of its loaded tablets and the
//! memory tables receiving its mutations. Readers take a snapshot of the
//! current [`TableState`]; writers build a new state and swap it in, so a
//! scan in progress keeps a consistent view until it reopens.

use crate::cell::Cell;
use crate::compaction::fragdag::{FragmentId, TabletId};
use crate::error::{Error, Result};
use crate::fragment::Fragment;
use crate::interval::Interval;
use crate::memtable::MemoryTable;
use crate::meta::compare_log_names;
use crate::txn::CommitRing;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Weak};

/// A fragment in a tablet's stack.
#[derive(Clone)]
pub struct FragmentRef {
    /// Id of the fragment in the fragment graph.
    pub id: FragmentId,
    /// The open fragment.
    pub fragment: Arc<dyn Fragment>,
}

impl fmt::Debug for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.id, self.fragment.uri())
    }
}

/// A loaded row range of a table.
#[derive(Debug, Clone)]
pub struct Tablet {
    /// Id of the tablet in the fragment graph.
    pub id: TabletId,
    /// Encoded tablet name.
    pub name: String,
    /// Rows the tablet serves.
    pub rows: Interval<Bytes>,
    /// Disk fragments, oldest first.
    pub fragments: Vec<FragmentRef>,
}

/// Immutable snapshot of a table's tablets and memory tables.
#[derive(Debug, Clone, Default)]
pub struct TableState {
    /// Tablets in row order.
    pub tablets: Vec<Tablet>,
    /// Memory tables, oldest first. The last one receives new mutations.
    pub memtables: Vec<Arc<MemoryTable>>,
}

impl TableState {
    /// The tablet where a scan starting at `lower` begins.
    pub fn tablet_for(&self, lower: &Bound<Bytes>) -> Option<&Tablet> {
        self.tablets.iter().find(|t| t.rows.admits_lower(lower))
    }

    /// The tablet holding `row`.
    pub fn tablet_of_row(&self, row: &Bytes) -> Option<&Tablet> {
        self.tablets.iter().find(|t| t.rows.contains(row))
    }
}

/// Notified when fragments under a row range change.
pub trait FragmentListener: Send + Sync {
    /// The fragment stack covering `rows` of table `table` was replaced.
    fn fragments_changed(&self, table: &str, rows: &Interval<Bytes>);
}

/// A table loaded on this server.
pub struct Table {
    name: String,
    state: RwLock<Arc<TableState>>,
    commits: Mutex<CommitRing>,
    listeners: Mutex<Vec<Weak<dyn FragmentListener>>>,
    log_mark: Mutex<Option<String>>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("tablets", &self.state.read().tablets.len())
            .finish()
    }
}

impl Table {
    /// A table serving `tablets` with an empty memory table.
    pub fn new(name: impl Into<String>, mut tablets: Vec<Tablet>, commit_ring_threshold: usize) -> Self {
        let name = name.into();
        tablets.sort_by(|a, b| a.rows.cmp_lower(&b.rows));
        let memtable = Arc::new(MemoryTable::new(format!("mem:{}", name)));
        Self {
            state: RwLock::new(Arc::new(TableState { tablets, memtables: vec![memtable] })),
            commits: Mutex::new(CommitRing::new(commit_ring_threshold)),
            listeners: Mutex::new(Vec::new()),
            log_mark: Mutex::new(None),
            name,
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state snapshot.
    pub fn state(&self) -> Arc<TableState> {
        Arc::clone(&self.state.read())
    }

    /// Check that every row is served by a loaded tablet.
    pub fn verify_tablets_loaded<'a>(&self, rows: impl IntoIterator<Item = &'a Bytes>) -> Result<()> {
        let state = self.state();
        for row in rows {
            if state.tablet_of_row(row).is_none() {
                return Err(Error::TabletNotLoaded(format!(
                    "{} row {}",
                    self.name,
                    String::from_utf8_lossy(row)
                )));
            }
        }
        Ok(())
    }

    /// Check that none of `rows` committed after `max_txn`.
    ///
    /// Rows that have fallen out of the commit ring are checked against
    /// its lower bound, so old transactions may be rejected even when the
    /// row did not change.
    pub fn verify_commit_applies<'a>(&self, rows: impl IntoIterator<Item = &'a Bytes>, max_txn: i64) -> Result<()> {
        let ring = self.commits.lock();
        if max_txn >= ring.get_max_commit() {
            return Ok(());
        }
        if max_txn < ring.get_min_commit() {
            return Err(Error::MutationConflict);
        }
        for row in rows {
            if ring.get_commit(row) > max_txn {
                return Err(Error::MutationConflict);
            }
        }
        Ok(())
    }

    /// Record that `rows` committed at `txn`.
    pub fn update_row_commits<'a>(&self, rows: impl IntoIterator<Item = &'a Bytes>, txn: i64) -> Result<()> {
        let mut ring = self.commits.lock();
        for row in rows {
            ring.set_commit(row.clone(), txn)?;
        }
        Ok(())
    }

    /// Last commit of `row`, or a lower bound on it.
    pub fn row_commit(&self, row: &[u8]) -> i64 {
        self.commits.lock().get_commit(row)
    }

    /// Name of the first commit log whose entries for this table are not
    /// yet in a fragment. Older logs are skipped on recovery.
    pub fn log_mark(&self) -> Option<String> {
        self.log_mark.lock().clone()
    }

    /// Move the log mark forward; older marks are ignored.
    pub fn set_log_mark(&self, mark: impl Into<String>) {
        let mark = mark.into();
        let mut current = self.log_mark.lock();
        if current.as_ref().map_or(true, |c| compare_log_names(c, &mark).is_lt()) {
            *current = Some(mark);
        }
    }

    /// The memory table receiving mutations.
    pub fn active_memtable(&self) -> Result<Arc<MemoryTable>> {
        self.state
            .read()
            .memtables
            .last()
            .cloned()
            .ok_or_else(|| Error::internal(format!("table {} has no memory table", self.name)))
    }

    /// Apply committed cells to the active memory table.
    pub fn apply_cells(&self, cells: Vec<Cell>) -> Result<()> {
        self.active_memtable()?.insert_all(cells);
        Ok(())
    }

    /// Start a new active memory table and return the previous one, which
    /// stays readable until replaced.
    pub fn freeze_memtable(&self) -> Result<Arc<MemoryTable>> {
        let mut guard = self.state.write();
        let frozen = guard
            .memtables
            .last()
            .cloned()
            .ok_or_else(|| Error::internal(format!("table {} has no memory table", self.name)))?;
        let mut next = TableState::clone(&guard);
        next.memtables.push(Arc::new(MemoryTable::new(format!("mem:{}", self.name))));
        *guard = Arc::new(next);
        Ok(frozen)
    }

    /// Whether `memtable` is still in this table's stack.
    pub fn holds_memtable(&self, memtable: &Arc<MemoryTable>) -> bool {
        self.state().memtables.iter().any(|m| Arc::ptr_eq(m, memtable))
    }

    /// Replace a frozen memory table with the fragment it was written to,
    /// placed on top of every tablet's stack.
    pub fn replace_memtable(&self, frozen: &Arc<MemoryTable>, fragment: Option<FragmentRef>) -> Result<()> {
        {
            let mut guard = self.state.write();
            let mut next = TableState::clone(&guard);
            let before = next.memtables.len();
            next.memtables.retain(|m| !Arc::ptr_eq(m, frozen));
            if next.memtables.len() == before {
                return Err(Error::invalid_state(format!("memory table not found in {}", self.name)));
            }
            if let Some(fragment) = fragment {
                for tablet in next.tablets.iter_mut() {
                    tablet.fragments.push(fragment.clone());
                }
            }
            *guard = Arc::new(next);
        }
        self.notify(&Interval::all());
        Ok(())
    }

    /// Replace the run `old` with `new` in every tablet inside `rows` whose
    /// stack holds that exact run.
    pub fn replace_fragments(&self, rows: &Interval<Bytes>, old: &[FragmentId], new: Option<FragmentRef>) -> Result<usize> {
        if old.is_empty() {
            return Err(Error::invalid_argument("no fragments to replace"));
        }
        let mut replaced = 0;
        {
            let mut guard = self.state.write();
            let mut next = TableState::clone(&guard);
            for tablet in next.tablets.iter_mut() {
                if !rows.contains_interval(&tablet.rows) {
                    continue;
                }
                let ids: Vec<FragmentId> = tablet.fragments.iter().map(|f| f.id).collect();
                let Some(pos) = ids.windows(old.len()).position(|w| w == old) else {
                    continue;
                };
                tablet.fragments.drain(pos..pos + old.len());
                if let Some(new) = &new {
                    tablet.fragments.insert(pos, new.clone());
                }
                replaced += 1;
            }
            *guard = Arc::new(next);
        }
        if replaced > 0 {
            self.notify(rows);
        }
        Ok(replaced)
    }

    /// The fragments to merge for the tablet where a scan starting at
    /// `lower` begins, oldest first, with the tablet's row range.
    pub fn fragment_chain(&self, lower: &Bound<Bytes>) -> Result<(Interval<Bytes>, Vec<Arc<dyn Fragment>>)> {
        let state = self.state();
        let tablet = state.tablet_for(lower).ok_or_else(|| {
            Error::TabletNotLoaded(format!("{} from {}", self.name, describe_bound(lower)))
        })?;
        let mut chain: Vec<Arc<dyn Fragment>> =
            tablet.fragments.iter().map(|f| Arc::clone(&f.fragment)).collect();
        chain.extend(state.memtables.iter().map(|m| Arc::clone(m) as Arc<dyn Fragment>));
        Ok((tablet.rows.clone(), chain))
    }

    /// Register a listener; it is dropped once the last strong reference
    /// goes away.
    pub fn add_listener(&self, listener: Weak<dyn FragmentListener>) {
        self.listeners.lock().push(listener);
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().iter().filter(|l| l.strong_count() > 0).count()
    }

    fn notify(&self, rows: &Interval<Bytes>) {
        let live: Vec<Arc<dyn FragmentListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.fragments_changed(&self.name, rows);
        }
    }
}

fn describe_bound(bound: &Bound<Bytes>) -> String {
    match bound {
        Bound::Included(row) => format!("[{}", String::from_utf8_lossy(row)),
        Bound::Excluded(row) => format!("({}", String::from_utf8_lossy(row)),
        Bound::Unbounded => "start".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::EmptyFragment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn split_table() -> Table {
        let low = Interval::new(Bound::Unbounded, Bound::Included(Bytes::from("m")));
        let high = Interval::new(Bound::Excluded(Bytes::from("m")), Bound::Unbounded);
        Table::new(
            "t",
            vec![
                Tablet { id: TabletId(2), name: "t!".into(), rows: high, fragments: Vec::new() },
                Tablet { id: TabletId(1), name: "t m".into(), rows: low, fragments: Vec::new() },
            ],
            1 << 20,
        )
    }

    fn frag(id: u64) -> FragmentRef {
        FragmentRef { id: FragmentId(id), fragment: Arc::new(EmptyFragment::new(format!("{}.frag", id))) }
    }

    #[test]
    fn test_tablets_sorted_and_located() {
        let table = split_table();
        let state = table.state();
        assert_eq!(state.tablets[0].name, "t m");
        assert_eq!(state.tablet_for(&Bound::Included(Bytes::from("m"))).unwrap().name, "t m");
        assert_eq!(state.tablet_for(&Bound::Excluded(Bytes::from("m"))).unwrap().name, "t!");
        assert_eq!(state.tablet_for(&Bound::Unbounded).unwrap().name, "t m");
    }

    #[test]
    fn test_verify_tablets_loaded() {
        let low = Interval::new(Bound::Unbounded, Bound::Included(Bytes::from("m")));
        let table = Table::new(
            "t",
            vec![Tablet { id: TabletId(1), name: "t m".into(), rows: low, fragments: Vec::new() }],
            1024,
        );
        assert!(table.verify_tablets_loaded([&Bytes::from("a")]).is_ok());
        let err = table.verify_tablets_loaded([&Bytes::from("z")]).unwrap_err();
        assert!(err.is_not_loaded());
    }

    #[test]
    fn test_commit_conflicts() {
        let table = split_table();
        let a = Bytes::from("a");
        let b = Bytes::from("b");
        table.update_row_commits([&a], 5).unwrap();
        table.update_row_commits([&b], 7).unwrap();
        assert!(table.verify_commit_applies([&a], 7).is_ok());
        assert!(table.verify_commit_applies([&a], 5).is_ok());
        assert!(matches!(table.verify_commit_applies([&a], 4), Err(Error::MutationConflict)));
        assert!(matches!(table.verify_commit_applies([&b], 6), Err(Error::MutationConflict)));
        assert_eq!(table.row_commit(b"b"), 7);
    }

    #[test]
    fn test_freeze_and_replace_memtable() {
        let table = split_table();
        table.apply_cells(vec![Cell::new("a", "c", 1, "v")]).unwrap();
        let frozen = table.freeze_memtable().unwrap();
        assert_eq!(frozen.len(), 1);
        assert_eq!(table.state().memtables.len(), 2);
        assert!(table.active_memtable().unwrap().is_empty());

        let (_, chain) = table.fragment_chain(&Bound::Unbounded).unwrap();
        assert_eq!(chain.len(), 2);

        table.replace_memtable(&frozen, Some(frag(1))).unwrap();
        let state = table.state();
        assert_eq!(state.memtables.len(), 1);
        assert!(state.tablets.iter().all(|t| t.fragments.len() == 1));
        assert!(table.replace_memtable(&frozen, None).is_err());
    }

    #[test]
    fn test_replace_fragments_in_contained_tablets() {
        let table = split_table();
        for id in 1..=3 {
            let frozen = table.freeze_memtable().unwrap();
            table.replace_memtable(&frozen, Some(frag(id))).unwrap();
        }
        let low = Interval::new(Bound::Unbounded, Bound::Included(Bytes::from("m")));
        let ids = [FragmentId(1), FragmentId(2)];
        assert_eq!(table.replace_fragments(&low, &ids, Some(frag(9))).unwrap(), 1);
        let state = table.state();
        let stacks: Vec<Vec<u64>> =
            state.tablets.iter().map(|t| t.fragments.iter().map(|f| f.id.0).collect()).collect();
        assert_eq!(stacks, vec![vec![9, 3], vec![1, 2, 3]]);
    }

    struct Counter(AtomicUsize);

    impl FragmentListener for Counter {
        fn fragments_changed(&self, _table: &str, _rows: &Interval<Bytes>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listeners_notified_and_pruned() {
        let table = split_table();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let listener: Arc<dyn FragmentListener> = counter.clone();
        table.add_listener(Arc::downgrade(&listener));
        assert_eq!(table.listener_count(), 1);

        let frozen = table.freeze_memtable().unwrap();
        table.replace_memtable(&frozen, None).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        drop(listener);
        drop(counter);
        assert_eq!(table.listener_count(), 0);
        let frozen = table.freeze_memtable().unwrap();
        table.replace_memtable(&frozen, None).unwrap();
    }

    #[test]
    fn test_log_mark_only_moves_forward() {
        let table = split_table();
        assert_eq!(table.log_mark(), None);
        table.set_log_mark("000004.log");
        table.set_log_mark("000002.log");
        assert_eq!(table.log_mark().as_deref(), Some("000004.log"));
        table.set_log_mark("1000000.log");
        assert_eq!(table.log_mark().as_deref(), Some("1000000.log"));
    }
}

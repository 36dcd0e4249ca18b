//! Writes frozen memory tables to disk fragments.

use crate::error::Result;
use crate::fragment::{BatchLimit, DiskFragmentWriter, Fragment, FragmentLoader, FragmentWriter};
use crate::memtable::MemoryTable;
use crate::merge::FragmentMerge;
use crate::predicate::ScanPredicate;
use crate::store::StoreContext;
use crate::table::{FragmentRef, Table};
use crate::worker::WorkerControl;
use std::sync::Arc;

const CHECK_INTERVAL_CELLS: usize = 4096;

/// Write `memtable`, a frozen memory table of `table`, to a new fragment
/// and put that fragment on top of every tablet of the table.
///
/// `log_mark` names the first commit log the table still needs once this
/// memory table is on disk; it is saved together with the new fragment.
/// An empty memory table is simply dropped. The written file is removed
/// if the work is cancelled or fails. Returns true if a fragment was added.
///
/// Calling it again after a failure is safe: a memory table that already
/// left the table only has its config saved again.
pub fn serialize_memtable(
    ctx: &StoreContext,
    table: &Table,
    memtable: &Arc<MemoryTable>,
    log_mark: Option<&str>,
    control: &WorkerControl,
) -> Result<bool> {
    if !table.holds_memtable(memtable) {
        // Published by an earlier attempt whose config save failed.
        let _dag = ctx.dag.lock();
        if let Some(mark) = log_mark {
            table.set_log_mark(mark);
        }
        ctx.save_table_config(table)?;
        log::info!("Saved config of {} for an already serialized memory table", table.name());
        return Ok(false);
    }
    if memtable.is_empty() {
        let _dag = ctx.dag.lock();
        table.replace_memtable(memtable, None)?;
        if let Some(mark) = log_mark {
            table.set_log_mark(mark);
            ctx.save_table_config(table)?;
        }
        return Ok(false);
    }

    let path = ctx.config.new_data_file()?;
    let mut writer = DiskFragmentWriter::create(&path, ctx.options.block_size, ctx.options.compression)?;
    let source: Arc<dyn Fragment> = Arc::clone(memtable) as Arc<dyn Fragment>;
    let written = (|| -> Result<u64> {
        let mut merge = FragmentMerge::new(vec![source], ScanPredicate::new(), false)?;
        loop {
            control.check()?;
            let limit = BatchLimit::beyond(&writer, CHECK_INTERVAL_CELLS, usize::MAX);
            if !merge.next_batch(&mut writer, limit)? {
                break;
            }
        }
        writer.finish()
    })();
    let size = match written {
        Ok(size) => size,
        Err(e) => {
            if let Err(discard) = writer.discard() {
                log::warn!("Failed to remove {}: {}", path.display(), discard);
            }
            return Err(e);
        }
    };
    let fragment = ctx.loader.load(&path)?;

    let mut dag = ctx.dag.lock();
    let id = dag.intern_fragment(fragment.uri(), size);
    for tablet in &table.state().tablets {
        dag.add_fragment(tablet.id, id)?;
    }
    table.replace_memtable(memtable, Some(FragmentRef { id, fragment }))?;
    if let Some(mark) = log_mark {
        table.set_log_mark(mark);
    }
    ctx.save_table_config(table)?;
    log::info!(
        "Serialized {} cells of {} to {} ({} bytes)",
        memtable.len(),
        table.name(),
        path.display(),
        size
    );
    Ok(true)
}

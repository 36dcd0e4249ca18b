//! Compaction of fragment stacks.
//!
//! Serialization keeps adding fragments on top of every tablet of a table,
//! so stacks only grow. Compaction picks the fragment whose lineages are
//! longest ([`FragDag::get_max_weight_fragment`]), grows it into a rooted
//! set, merges the members of that set under each affected tablet into one
//! new fragment and swaps the output in for the inputs.
//!
//! ## Process
//!
//! 1. With the graph locked, choose the set and build the range map
//! 2. Unlocked, merge the ranges into a new fragment file (compactor.rs)
//! 3. With the graph locked, replace inputs in the graph and the tables,
//!    then save the tablet configs
//! 4. Retire inputs no tablet uses; their files go once the last reader
//!    lets go

pub mod compactor;
pub mod fragdag;
pub mod serializer;

pub use compactor::{CompactedRange, CompactionBudget, Compactor, RangeFragmentMap, RangeFragments};
pub use fragdag::{FragDag, FragmentId, FragmentSet, TabletId};
pub use serializer::serialize_memtable;

use crate::error::{Error, Result};
use crate::fragment::{DiskFragmentWriter, Fragment, FragmentLoader, FragmentWriter};
use crate::store::StoreContext;
use crate::table::{FragmentRef, Table};
use crate::worker::WorkerControl;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Work chosen for one compaction.
struct CompactionPlan {
    table: Arc<Table>,
    map: RangeFragmentMap,
    drop_erasures: bool,
    inputs: HashMap<FragmentId, Arc<dyn Fragment>>,
}

/// What one compaction did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Ranges whose stacks were replaced.
    pub ranges: usize,
    /// Cells written.
    pub cells: usize,
    /// Input fragments no longer used by any tablet.
    pub retired: usize,
}

/// Run one compaction if any tablet has more than one fragment.
///
/// Tables whose config failed to save after an earlier run are saved
/// first. Returns `None` when there was nothing to do.
pub fn run_compaction(ctx: &StoreContext, control: &WorkerControl) -> Result<Option<CompactionStats>> {
    let _running = ctx.compaction_lock.lock();
    ctx.save_unsaved_tables()?;
    let Some(plan) = plan_compaction(ctx)? else {
        return Ok(None);
    };

    let path = ctx.config.new_data_file()?;
    let mut writer = DiskFragmentWriter::create(&path, ctx.options.block_size, ctx.options.compression)?;
    let budget = CompactionBudget {
        output: ctx.options.compaction_output_budget,
        time: ctx.options.compaction_time_budget,
    };
    let compacted = match Compactor::new(plan.drop_erasures, budget).compact(&plan.map, &mut writer, control) {
        Ok(compacted) => compacted,
        Err(e) => {
            discard(writer, &path);
            return Err(e);
        }
    };
    let cells: usize = compacted.iter().map(|r| r.cell_count).sum();

    let output = if cells == 0 {
        discard(writer, &path);
        None
    } else {
        let size = writer.finish()?;
        Some((ctx.loader.load(&path)?, size))
    };

    let mut dag = ctx.dag.lock();
    let new_ref = output.map(|(fragment, size)| FragmentRef { id: dag.intern_fragment(fragment.uri(), size), fragment });
    let mut dead = Vec::new();
    for range in &compacted {
        dead.extend(dag.replace_fragments(&range.ids, new_ref.as_ref().map(|r| r.id), &range.rows)?);
        plan.table.replace_fragments(&range.rows, &range.ids, new_ref.clone())?;
    }
    if let Some(new_ref) = &new_ref {
        if dag.tablets_of(new_ref.id).next().is_none() {
            log::warn!("Compaction output {} replaced nothing", new_ref.fragment.uri());
            dag.forget_fragment(new_ref.id)?;
            ctx.retire_fragment(&new_ref.fragment)?;
        }
    }
    dead.sort();
    dead.dedup();
    let retired: Vec<Arc<dyn Fragment>> = dead.iter().filter_map(|id| plan.inputs.get(id).cloned()).collect();
    if let Err(e) = ctx.save_table_config(&plan.table) {
        log::error!(
            "Failed to save {} after compaction, keeping {} inputs until the next save: {}",
            plan.table.name(),
            retired.len(),
            e
        );
        ctx.retire_after_save(plan.table.name(), retired);
        return Err(e);
    }
    drop(dag);

    for fragment in &retired {
        ctx.retire_fragment(fragment)?;
    }
    let stats = CompactionStats { ranges: compacted.len(), cells, retired: dead.len() };
    log::info!(
        "Compacted {} ranges of {} into {} cells, retired {} fragments",
        stats.ranges,
        plan.table.name(),
        stats.cells,
        stats.retired
    );
    Ok(Some(stats))
}

fn plan_compaction(ctx: &StoreContext) -> Result<Option<CompactionPlan>> {
    let dag = ctx.dag.lock();
    let Some(seed) = dag.get_max_weight_fragment(0) else {
        return Ok(None);
    };
    let set = dag.choose_compaction_set(
        seed,
        ctx.options.compaction_max_fragments,
        ctx.options.compaction_max_size,
    );
    let list = dag.choose_compaction_list(&set)?;
    if list.is_empty() {
        return Ok(None);
    }
    let tablets = dag.tablets_of_set(&set);
    let table_name = tablets
        .iter()
        .find_map(|&t| dag.tablet_table(t))
        .ok_or_else(|| Error::internal("compaction set has no tablets"))?
        .to_string();
    if tablets.iter().any(|&t| dag.tablet_table(t) != Some(table_name.as_str())) {
        return Err(Error::invalid_state("compaction set spans tables"));
    }
    let table = ctx.table(&table_name)?;
    let state = table.state();

    let mut map = RangeFragmentMap::new();
    let mut inputs = HashMap::new();
    for tablet in &state.tablets {
        if !tablets.contains(&tablet.id) {
            continue;
        }
        let ids = dag.filter_tablet_fragments(tablet.id, &set);
        let mut fragments = Vec::with_capacity(ids.len());
        for id in &ids {
            let found = tablet
                .fragments
                .iter()
                .find(|f| f.id == *id)
                .ok_or_else(|| Error::invalid_state(format!("{:?} missing from tablet {}", id, tablet.name)))?;
            inputs.insert(*id, Arc::clone(&found.fragment));
            fragments.push(Arc::clone(&found.fragment));
        }
        map.push(RangeFragments { rows: tablet.rows.clone(), ids, fragments });
    }
    log::debug!("Compacting {} fragments of {} over {} ranges", list.len(), table_name, map.len());
    Ok(Some(CompactionPlan { table, map, drop_erasures: dag.is_rooted(&set), inputs }))
}

fn discard(writer: DiskFragmentWriter, path: &Path) {
    if let Err(e) = writer.discard() {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

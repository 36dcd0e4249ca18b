//! Fragment dependency graph.
//!
//! Every tablet has a lineage: the chain of fragments holding its data,
//! oldest first. Within a chain each fragment is the *parent* of the one
//! after it and the *child* of the one before it. Because fragments can be
//! shared by several tablets, the union of all lineages forms a DAG over
//! fragments.
//!
//! Fragments and tablets are addressed by integer ids; adjacency is derived
//! from the chains rather than stored as links between nodes.
//!
//! A set of fragments is *rooted* when it contains every parent of its
//! members. Compacting a rooted set replaces a prefix of each affected
//! chain, so the output can take the place of its inputs at the bottom of
//! every lineage.

use crate::error::{Error, Result};
use crate::interval::{Interval, IntervalSet};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Identifies a fragment in a [`FragDag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub u64);

/// Identifies a tablet in a [`FragDag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletId(pub u64);

#[derive(Debug)]
struct FragmentNode {
    uri: String,
    size: u64,
    tablets: BTreeSet<TabletId>,
}

#[derive(Debug)]
struct TabletNode {
    table: String,
    rows: Interval<Bytes>,
    chain: Vec<FragmentId>,
}

/// Lineages of every loaded tablet.
#[derive(Debug, Default)]
pub struct FragDag {
    fragments: BTreeMap<FragmentId, FragmentNode>,
    by_uri: HashMap<String, FragmentId>,
    tablets: BTreeMap<TabletId, TabletNode>,
    next_fragment: u64,
    next_tablet: u64,
}

/// A set of fragment ids.
pub type FragmentSet = BTreeSet<FragmentId>;

impl FragDag {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tablet with an empty lineage.
    pub fn add_tablet(&mut self, table: impl Into<String>, rows: Interval<Bytes>) -> TabletId {
        self.next_tablet += 1;
        let id = TabletId(self.next_tablet);
        self.tablets.insert(id, TabletNode { table: table.into(), rows, chain: Vec::new() });
        id
    }

    /// Drop a tablet. Returns the fragments no longer used by any tablet.
    pub fn remove_tablet(&mut self, tablet: TabletId) -> Vec<FragmentId> {
        let Some(node) = self.tablets.remove(&tablet) else {
            return Vec::new();
        };
        let mut dead = Vec::new();
        for id in node.chain {
            if let Some(frag) = self.fragments.get_mut(&id) {
                frag.tablets.remove(&tablet);
                if frag.tablets.is_empty() {
                    dead.push(id);
                }
            }
        }
        for id in &dead {
            self.drop_node(*id);
        }
        dead
    }

    /// Id for the fragment stored at `uri`, registering it if unseen.
    pub fn intern_fragment(&mut self, uri: &str, size: u64) -> FragmentId {
        if let Some(&id) = self.by_uri.get(uri) {
            return id;
        }
        self.next_fragment += 1;
        let id = FragmentId(self.next_fragment);
        self.fragments.insert(id, FragmentNode { uri: uri.to_string(), size, tablets: BTreeSet::new() });
        self.by_uri.insert(uri.to_string(), id);
        id
    }

    /// Append `fragment` to the top of `tablet`'s lineage.
    pub fn add_fragment(&mut self, tablet: TabletId, fragment: FragmentId) -> Result<()> {
        let node = self
            .fragments
            .get_mut(&fragment)
            .ok_or_else(|| Error::not_found(format!("fragment {:?}", fragment)))?;
        let lineage = self
            .tablets
            .get_mut(&tablet)
            .ok_or_else(|| Error::not_found(format!("tablet {:?}", tablet)))?;
        if lineage.chain.contains(&fragment) {
            return Err(Error::invalid_state(format!("{} already in lineage of {:?}", node.uri, tablet)));
        }
        lineage.chain.push(fragment);
        node.tablets.insert(tablet);
        Ok(())
    }

    /// Forget an unreferenced fragment. Returns its uri.
    pub fn forget_fragment(&mut self, fragment: FragmentId) -> Result<String> {
        match self.fragments.get(&fragment) {
            Some(node) if !node.tablets.is_empty() => {
                Err(Error::invalid_state(format!("{} is still referenced", node.uri)))
            }
            Some(_) => Ok(self.drop_node(fragment).unwrap_or_default()),
            None => Err(Error::not_found(format!("fragment {:?}", fragment))),
        }
    }

    fn drop_node(&mut self, id: FragmentId) -> Option<String> {
        let node = self.fragments.remove(&id)?;
        self.by_uri.remove(&node.uri);
        Some(node.uri)
    }

    /// Uri of a fragment.
    pub fn fragment_uri(&self, fragment: FragmentId) -> Option<&str> {
        self.fragments.get(&fragment).map(|n| n.uri.as_str())
    }

    /// Size of a fragment.
    pub fn fragment_size(&self, fragment: FragmentId) -> u64 {
        self.fragments.get(&fragment).map_or(0, |n| n.size)
    }

    /// Number of fragments in the graph.
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Id of the fragment at `uri`, if registered.
    pub fn fragment_id(&self, uri: &str) -> Option<FragmentId> {
        self.by_uri.get(uri).copied()
    }

    /// Tablets whose lineage includes `fragment`.
    pub fn tablets_of(&self, fragment: FragmentId) -> impl Iterator<Item = TabletId> + '_ {
        self.fragments.get(&fragment).into_iter().flat_map(|n| n.tablets.iter().copied())
    }

    /// Lineage of a tablet, oldest first.
    pub fn tablet_chain(&self, tablet: TabletId) -> &[FragmentId] {
        self.tablets.get(&tablet).map(|t| t.chain.as_slice()).unwrap_or(&[])
    }

    /// Row range of a tablet.
    pub fn tablet_rows(&self, tablet: TabletId) -> Option<&Interval<Bytes>> {
        self.tablets.get(&tablet).map(|t| &t.rows)
    }

    /// Table a tablet belongs to.
    pub fn tablet_table(&self, tablet: TabletId) -> Option<&str> {
        self.tablets.get(&tablet).map(|t| t.table.as_str())
    }

    /// The fragment below `fragment` in `tablet`'s lineage.
    pub fn get_parent(&self, fragment: FragmentId, tablet: TabletId) -> Option<FragmentId> {
        let chain = self.tablet_chain(tablet);
        let pos = chain.iter().position(|&f| f == fragment)?;
        pos.checked_sub(1).map(|p| chain[p])
    }

    /// The fragment above `fragment` in `tablet`'s lineage.
    pub fn get_child(&self, fragment: FragmentId, tablet: TabletId) -> Option<FragmentId> {
        let chain = self.tablet_chain(tablet);
        let pos = chain.iter().position(|&f| f == fragment)?;
        chain.get(pos + 1).copied()
    }

    /// Parents of members that are not themselves members.
    pub fn parent_set(&self, set: &FragmentSet) -> FragmentSet {
        self.neighbours(set, |dag, f, t| dag.get_parent(f, t))
    }

    /// Children of members that are not themselves members.
    pub fn child_set(&self, set: &FragmentSet) -> FragmentSet {
        self.neighbours(set, |dag, f, t| dag.get_child(f, t))
    }

    /// Parents and children of members that are not themselves members.
    pub fn adjacent_set(&self, set: &FragmentSet) -> FragmentSet {
        let mut adjacent = self.parent_set(set);
        adjacent.extend(self.child_set(set));
        adjacent
    }

    fn neighbours<F>(&self, set: &FragmentSet, step: F) -> FragmentSet
    where
        F: Fn(&Self, FragmentId, TabletId) -> Option<FragmentId>,
    {
        let mut out = FragmentSet::new();
        for &f in set {
            for t in self.tablets_of(f) {
                if let Some(n) = step(self, f, t) {
                    if !set.contains(&n) {
                        out.insert(n);
                    }
                }
            }
        }
        out
    }

    /// `fragment` and every fragment below it in any lineage.
    pub fn ancestors(&self, fragment: FragmentId) -> FragmentSet {
        let mut set = FragmentSet::new();
        set.insert(fragment);
        loop {
            let parents = self.parent_set(&set);
            if parents.is_empty() {
                return set;
            }
            set.extend(parents);
        }
    }

    /// True if every parent of a member is a member.
    pub fn is_rooted(&self, set: &FragmentSet) -> bool {
        self.parent_set(set).is_empty()
    }

    /// Row ranges of the tablets using `fragment`.
    pub fn active_ranges(&self, fragment: FragmentId) -> IntervalSet<Bytes> {
        self.tablets_of(fragment)
            .filter_map(|t| self.tablet_rows(t).cloned())
            .collect()
    }

    /// Size of `fragment` if any tablet uses it, else zero.
    pub fn active_size(&self, fragment: FragmentId) -> u64 {
        match self.fragments.get(&fragment) {
            Some(node) if !node.tablets.is_empty() => node.size,
            _ => 0,
        }
    }

    /// How much compacting `fragment` would shorten lineages: the number of
    /// other fragments stacked with it, summed over its tablets.
    pub fn weight(&self, fragment: FragmentId) -> usize {
        self.tablets_of(fragment)
            .map(|t| self.tablet_chain(t).len().saturating_sub(1))
            .sum()
    }

    /// The heaviest fragment whose weight exceeds `min_weight`. Ties go to
    /// the lowest id.
    pub fn get_max_weight_fragment(&self, min_weight: usize) -> Option<FragmentId> {
        let mut best: Option<(usize, FragmentId)> = None;
        for &id in self.fragments.keys() {
            let weight = self.weight(id);
            if weight > min_weight && best.map_or(true, |(w, _)| weight > w) {
                best = Some((weight, id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Grow `seed` into a rooted set to compact.
    ///
    /// The seed and its ancestors are always included. Adjacent fragments
    /// are then added smallest first, each with its ancestors, while the
    /// set stays within `max_fragments` and `max_size`.
    pub fn choose_compaction_set(&self, seed: FragmentId, max_fragments: usize, max_size: u64) -> FragmentSet {
        let mut set = self.ancestors(seed);
        let mut size: u64 = set.iter().map(|&f| self.fragment_size(f)).sum();
        while set.len() < max_fragments && size < max_size {
            let mut candidates: Vec<FragmentId> = self.adjacent_set(&set).into_iter().collect();
            candidates.sort_by_key(|&f| (self.fragment_size(f), f));
            let mut grew = false;
            for candidate in candidates {
                let extra: FragmentSet = self.ancestors(candidate).difference(&set).copied().collect();
                let extra_size: u64 = extra.iter().map(|&f| self.fragment_size(f)).sum();
                if set.len() + extra.len() <= max_fragments && size + extra_size <= max_size {
                    set.extend(extra);
                    size += extra_size;
                    grew = true;
                    break;
                }
            }
            if !grew {
                break;
            }
        }
        set
    }

    /// Order a set so every fragment follows its parents. Lower ids go
    /// first among unordered fragments. Sets of fewer than two fragments
    /// give an empty list.
    pub fn choose_compaction_list(&self, set: &FragmentSet) -> Result<Vec<FragmentId>> {
        if set.len() < 2 {
            return Ok(Vec::new());
        }
        let mut indegree: BTreeMap<FragmentId, usize> = set.iter().map(|&f| (f, 0)).collect();
        let mut edges: BTreeMap<FragmentId, BTreeSet<FragmentId>> = BTreeMap::new();
        for tablet in self.tablets_of_set(set) {
            let members = self.filter_tablet_fragments(tablet, set);
            for pair in members.windows(2) {
                if edges.entry(pair[0]).or_default().insert(pair[1]) {
                    *indegree.entry(pair[1]).or_default() += 1;
                }
            }
        }

        let mut ready: BTreeSet<FragmentId> =
            indegree.iter().filter(|(_, &d)| d == 0).map(|(&f, _)| f).collect();
        let mut list = Vec::with_capacity(set.len());
        while let Some(f) = ready.pop_first() {
            list.push(f);
            for child in edges.get(&f).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
        if list.len() != set.len() {
            return Err(Error::invalid_state("fragment lineages form a cycle"));
        }
        Ok(list)
    }

    /// Tablets using any member of `set`.
    pub fn tablets_of_set(&self, set: &FragmentSet) -> BTreeSet<TabletId> {
        set.iter().flat_map(|&f| self.tablets_of(f)).collect()
    }

    /// Members of `set` in `tablet`'s lineage, oldest first.
    pub fn filter_tablet_fragments(&self, tablet: TabletId, set: &FragmentSet) -> Vec<FragmentId> {
        self.tablet_chain(tablet).iter().copied().filter(|f| set.contains(f)).collect()
    }

    /// Replace the run `old` with `new` in the lineage of every tablet
    /// inside `rows` whose lineage holds that exact run.
    ///
    /// Returns the fragments of `old` no longer used by any tablet; they
    /// are removed from the graph.
    pub fn replace_fragments(
        &mut self,
        old: &[FragmentId],
        new: Option<FragmentId>,
        rows: &Interval<Bytes>,
    ) -> Result<Vec<FragmentId>> {
        if old.is_empty() {
            return Err(Error::invalid_argument("no fragments to replace"));
        }
        if let Some(n) = new {
            if !self.fragments.contains_key(&n) {
                return Err(Error::not_found(format!("fragment {:?}", n)));
            }
        }

        let mut replaced = Vec::new();
        for (&id, tablet) in self.tablets.iter_mut() {
            if !rows.contains_interval(&tablet.rows) {
                continue;
            }
            let Some(pos) = find_run(&tablet.chain, old) else {
                continue;
            };
            tablet.chain.drain(pos..pos + old.len());
            if let Some(n) = new {
                tablet.chain.insert(pos, n);
            }
            replaced.push(id);
        }

        for tablet in &replaced {
            for f in old {
                if let Some(node) = self.fragments.get_mut(f) {
                    node.tablets.remove(tablet);
                }
            }
            if let Some(node) = new.and_then(|n| self.fragments.get_mut(&n)) {
                node.tablets.insert(*tablet);
            }
        }

        let dead: Vec<FragmentId> = old
            .iter()
            .copied()
            .filter(|f| self.fragments.get(f).is_some_and(|n| n.tablets.is_empty()))
            .collect();
        for f in &dead {
            self.drop_node(*f);
        }
        Ok(dead)
    }
}

fn find_run(chain: &[FragmentId], run: &[FragmentId]) -> Option<usize> {
    if run.len() > chain.len() {
        return None;
    }
    chain.windows(run.len()).position(|w| w == run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Bound;

    fn rows(lo: Option<&'static str>, hi: Option<&'static str>) -> Interval<Bytes> {
        Interval::new(
            lo.map_or(Bound::Unbounded, |v| Bound::Excluded(Bytes::from(v))),
            hi.map_or(Bound::Unbounded, |v| Bound::Included(Bytes::from(v))),
        )
    }

    fn set(ids: &[FragmentId]) -> FragmentSet {
        ids.iter().copied().collect()
    }

    // Two tablets sharing a bottom fragment:
    //   t1: a b c
    //   t2: a d
    fn sample() -> (FragDag, TabletId, TabletId, [FragmentId; 4]) {
        let mut dag = FragDag::new();
        let t1 = dag.add_tablet("t", rows(None, Some("m")));
        let t2 = dag.add_tablet("t", rows(Some("m"), None));
        let a = dag.intern_fragment("a.frag", 100);
        let b = dag.intern_fragment("b.frag", 10);
        let c = dag.intern_fragment("c.frag", 20);
        let d = dag.intern_fragment("d.frag", 30);
        for (t, f) in [(t1, a), (t1, b), (t1, c), (t2, a), (t2, d)] {
            dag.add_fragment(t, f).unwrap();
        }
        (dag, t1, t2, [a, b, c, d])
    }

    #[test]
    fn test_intern_reuses_id() {
        let mut dag = FragDag::new();
        let a = dag.intern_fragment("x.frag", 1);
        assert_eq!(dag.intern_fragment("x.frag", 1), a);
        assert_ne!(dag.intern_fragment("y.frag", 1), a);
        assert_eq!(dag.fragment_id("x.frag"), Some(a));
    }

    #[test]
    fn test_parents_and_children() {
        let (dag, t1, t2, [a, b, c, d]) = sample();
        assert_eq!(dag.get_parent(b, t1), Some(a));
        assert_eq!(dag.get_parent(a, t1), None);
        assert_eq!(dag.get_child(a, t2), Some(d));
        assert_eq!(dag.parent_set(&set(&[c])), set(&[b]));
        assert_eq!(dag.child_set(&set(&[a])), set(&[b, d]));
        assert_eq!(dag.adjacent_set(&set(&[b])), set(&[a, c]));
        assert_eq!(dag.ancestors(c), set(&[a, b, c]));
        assert!(dag.is_rooted(&set(&[a, b])));
        assert!(!dag.is_rooted(&set(&[b, c])));
    }

    #[test]
    fn test_weights() {
        let (dag, _, _, [a, b, c, d]) = sample();
        assert_eq!(dag.weight(a), 2 + 1);
        assert_eq!(dag.weight(b), 2);
        assert_eq!(dag.weight(d), 1);
        assert_eq!(dag.get_max_weight_fragment(0), Some(a));
        assert_eq!(dag.get_max_weight_fragment(3), None);
        assert_eq!(dag.weight(c), 2);
        assert_eq!(dag.active_ranges(a).len(), 1);
        assert_eq!(dag.active_size(b), 10);
    }

    #[test]
    fn test_max_weight_ties_go_to_lowest_id() {
        let mut dag = FragDag::new();
        let t1 = dag.add_tablet("t", rows(None, Some("m")));
        let t2 = dag.add_tablet("t", rows(Some("m"), None));
        let x = dag.intern_fragment("x", 1);
        let y = dag.intern_fragment("y", 1);
        let z = dag.intern_fragment("z", 1);
        for (t, f) in [(t1, y), (t1, x), (t2, z), (t2, y)] {
            dag.add_fragment(t, f).unwrap();
        }
        assert_eq!(dag.weight(x), 1);
        assert_eq!(dag.weight(y), 2);
        assert_eq!(dag.get_max_weight_fragment(0), Some(y));
        assert_eq!(dag.get_max_weight_fragment(1), Some(y));
        dag.remove_tablet(t2);
        assert_eq!(dag.get_max_weight_fragment(0), Some(x));
    }

    #[test]
    fn test_compaction_set_is_rooted() {
        let (dag, _, _, [a, b, c, d]) = sample();
        let chosen = dag.choose_compaction_set(c, 16, u64::MAX);
        assert!(dag.is_rooted(&chosen));
        assert_eq!(chosen, set(&[a, b, c, d]));

        // The seed closure is kept even past the limits.
        let tight = dag.choose_compaction_set(c, 2, u64::MAX);
        assert_eq!(tight, set(&[a, b, c]));

        let by_size = dag.choose_compaction_set(b, 16, 115);
        assert_eq!(by_size, set(&[a, b]));
    }

    #[test]
    fn test_compaction_list_is_topological() {
        let (dag, _, _, [a, b, c, d]) = sample();
        let list = dag.choose_compaction_list(&set(&[a, b, c, d])).unwrap();
        assert_eq!(list, vec![a, b, c, d]);
        assert!(dag.choose_compaction_list(&set(&[a])).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_is_error() {
        let mut dag = FragDag::new();
        let t1 = dag.add_tablet("t", rows(None, Some("m")));
        let t2 = dag.add_tablet("t", rows(Some("m"), None));
        let a = dag.intern_fragment("a", 1);
        let b = dag.intern_fragment("b", 1);
        for (t, f) in [(t1, a), (t1, b), (t2, b), (t2, a)] {
            dag.add_fragment(t, f).unwrap();
        }
        assert!(dag.choose_compaction_list(&set(&[a, b])).is_err());
    }

    #[test]
    fn test_replace_fragments() {
        let (mut dag, t1, t2, [a, b, c, d]) = sample();
        let e = dag.intern_fragment("e.frag", 50);

        let dead = dag.replace_fragments(&[a, b, c], Some(e), &rows(None, Some("m"))).unwrap();
        assert!(dead.contains(&b) && dead.contains(&c));
        assert!(!dead.contains(&a));
        assert_eq!(dag.tablet_chain(t1), &[e]);
        assert_eq!(dag.tablet_chain(t2), &[a, d]);

        let dead = dag.replace_fragments(&[a, d], None, &Interval::all()).unwrap();
        assert_eq!(dead, vec![a, d]);
        assert!(dag.tablet_chain(t2).is_empty());
        assert_eq!(dag.fragment_count(), 1);
        assert_eq!(dag.fragment_uri(e), Some("e.frag"));
    }

    #[test]
    fn test_replace_requires_exact_run() {
        let (mut dag, t1, _, [a, _, c, _]) = sample();
        let e = dag.intern_fragment("e.frag", 1);
        let dead = dag.replace_fragments(&[a, c], Some(e), &Interval::all()).unwrap();
        assert!(dead.is_empty());
        assert_eq!(dag.tablet_chain(t1).len(), 3);
        assert_eq!(dag.forget_fragment(e).unwrap(), "e.frag");
    }

    #[test]
    fn test_remove_tablet() {
        let (mut dag, t1, _, [_, b, c, _]) = sample();
        let dead = dag.remove_tablet(t1);
        assert_eq!(dead, vec![b, c]);
        assert_eq!(dag.fragment_count(), 2);
    }
}

//! Conditional clade distribution (CCD) over rooted binary trees.
//!
//! A CCD factorises a distribution over tree topologies into per-clade
//! categorical distributions: each observed clade carries the splits seen
//! for it, weighted by relative frequency (the conditional clade
//! probability, CCP). The clades form a DAG with shared substructure —
//! a clade observed in many trees exists once and is referenced by every
//! parent that splits into it.
//!
//! Construction is one pass over the input trees; everything else
//! (marginal clade probabilities, entropies, the maximum-probability
//! tree, per-tree log-probabilities, the topology count) is derived from
//! the DAG and cached until the next `add_tree`.

use crate::bitset::Bitset;
use crate::clade::{Clade, CladeId, CladePartition};
use crate::error::{Error, Result};
use crate::tree::Tree;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Marginal probabilities in `(1, 1 + CLIP]` are rounding noise and snap
/// back to 1.
const PROBABILITY_CLIP: f64 = 1e-5;

/// Number of clades between progress reports in the entropy and
/// max-probability computations.
pub const PROGRESS_CLADE_INTERVAL: usize = 100;

/// Stable bijection between taxon labels and bit positions `[0, L)`.
///
/// Labels are sorted lexicographically before positions are assigned, so
/// the same taxon set always yields the same bit layout. The index is
/// frozen once a CCD starts ingesting trees; labels outside it fail with
/// [`Error::TaxonUnknown`].
#[derive(Debug, Clone)]
pub struct TaxonIndex {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl TaxonIndex {
    /// Index over the union of leaf labels of all given trees.
    pub fn from_trees(trees: &[Tree]) -> Self {
        let set: BTreeSet<String> = trees.iter().flat_map(|t| t.tip_labels()).collect();
        Self::from_labels(set)
    }

    pub fn from_labels(labels: impl IntoIterator<Item = String>) -> Self {
        let mut labels: Vec<String> = labels.into_iter().collect();
        labels.sort();
        labels.dedup();
        let index = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        TaxonIndex { labels, index }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn bit_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label_of(&self, bit: usize) -> &str {
        &self.labels[bit]
    }
}

/// A conditional clade distribution under construction or query.
#[derive(Debug, Clone)]
pub struct Ccd {
    taxa: TaxonIndex,
    clades: Vec<Clade>,
    clade_ids: HashMap<Bitset, CladeId>,
    root: CladeId,
    num_base_trees: usize,

    ccps_dirty: bool,
    probabilities_dirty: bool,
    entropy_dirty: bool,
    topology_count_dirty: bool,
    cached_entropy: Option<f64>,
    cached_entropy_lewis: Option<f64>,
    cached_max_log: Option<f64>,
    cached_topology_count: Option<f64>,
}

impl Ccd {
    /// An empty CCD over the given taxa. The root clade (all taxa) is
    /// created eagerly so it exists even before the first tree arrives.
    pub fn new(taxa: TaxonIndex) -> Self {
        let mut root_bits = Bitset::with_bits(taxa.len());
        root_bits.set_range(0, taxa.len());
        let mut clade_ids = HashMap::new();
        clade_ids.insert(root_bits.clone(), 0);
        Ccd {
            taxa,
            clades: vec![Clade::new(root_bits)],
            clade_ids,
            root: 0,
            num_base_trees: 0,
            ccps_dirty: true,
            probabilities_dirty: true,
            entropy_dirty: true,
            topology_count_dirty: true,
            cached_entropy: None,
            cached_entropy_lewis: None,
            cached_max_log: None,
            cached_topology_count: None,
        }
    }

    pub fn taxa(&self) -> &TaxonIndex {
        &self.taxa
    }

    pub fn num_leaves(&self) -> usize {
        self.taxa.len()
    }

    pub fn num_clades(&self) -> usize {
        self.clades.len()
    }

    pub fn num_base_trees(&self) -> usize {
        self.num_base_trees
    }

    pub fn root_id(&self) -> CladeId {
        self.root
    }

    pub fn clade(&self, id: CladeId) -> &Clade {
        &self.clades[id]
    }

    pub fn clade_id_of(&self, bits: &Bitset) -> Option<CladeId> {
        self.clade_ids.get(bits).copied()
    }

    /// Taxon labels of a clade, in bit order.
    pub fn clade_taxa(&self, id: CladeId) -> Vec<&str> {
        self.clades[id]
            .bits
            .ones()
            .map(|bit| self.taxa.label_of(bit))
            .collect()
    }

    /// Human-readable clade rendering, e.g. `{A,B,C}`.
    pub fn clade_label(&self, id: CladeId) -> String {
        format!("{{{}}}", self.clade_taxa(id).join(","))
    }

    /// Ingest one tree: every vertex contributes a clade occurrence,
    /// every internal vertex a partition occurrence.
    ///
    /// The tree is validated first (taxa known, strictly binary), so a
    /// failed ingestion leaves the CCD untouched.
    pub fn add_tree(&mut self, tree: &Tree) -> Result<()> {
        let order = tree.postorder();
        let num_bits = self.taxa.len();

        // Pass 1: bitsets per vertex, bottom-up; fails without mutation
        let mut node_bits: Vec<Bitset> = vec![Bitset(Vec::new()); tree.len()];
        for &id in &order {
            let node = tree.node(id);
            node_bits[id] = match node.children.len() {
                0 => {
                    let label = tree.leaf_label(id);
                    let bit = self.taxa.bit_of(&label).ok_or_else(|| Error::TaxonUnknown {
                        label,
                        known: num_bits,
                    })?;
                    Bitset::singleton(num_bits, bit)
                }
                2 => {
                    let mut bits = node_bits[node.children[0]].clone();
                    bits.or_assign(&node_bits[node.children[1]]);
                    bits
                }
                n => {
                    return Err(Error::malformed(format!(
                        "internal node {id} has {n} children; trees must be strictly binary"
                    )));
                }
            };
        }

        // Pass 2: commit occurrence counts and partitions
        for &id in &order {
            let node = tree.node(id);
            let clade_id = self.get_or_create_clade(&node_bits[id]);
            let clade = &mut self.clades[clade_id];
            clade.occurrence_count += 1;
            clade.sum_occurred_heights += node.height;

            if node.children.len() == 2 {
                let c1 = self.clade_ids[&node_bits[node.children[0]]];
                let c2 = self.clade_ids[&node_bits[node.children[1]]];
                let clade = &mut self.clades[clade_id];
                let pidx = match clade.find_partition(c1, c2) {
                    Some(pidx) => pidx,
                    None => {
                        clade.partitions.push(CladePartition::new(c1, c2));
                        clade.partitions.len() - 1
                    }
                };
                clade.partitions[pidx].occurrence_count += 1;
                clade.partitions[pidx].sum_occurred_heights += node.height;
                clade.child_clades.insert(c1);
                clade.child_clades.insert(c2);
                self.clades[c1].parent_clades.insert(clade_id);
                self.clades[c2].parent_clades.insert(clade_id);
            }
        }

        self.num_base_trees += 1;
        self.mark_dirty();
        Ok(())
    }

    fn get_or_create_clade(&mut self, bits: &Bitset) -> CladeId {
        if let Some(&id) = self.clade_ids.get(bits) {
            return id;
        }
        let id = self.clades.len();
        self.clade_ids.insert(bits.clone(), id);
        self.clades.push(Clade::new(bits.clone()));
        id
    }

    fn mark_dirty(&mut self) {
        self.ccps_dirty = true;
        self.probabilities_dirty = true;
        self.entropy_dirty = true;
        self.topology_count_dirty = true;
        self.cached_entropy = None;
        self.cached_entropy_lewis = None;
        self.cached_max_log = None;
        self.cached_topology_count = None;
        for clade in &mut self.clades {
            clade.clear_caches();
        }
    }

    /// Normalise partition occurrence counts into CCPs.
    ///
    /// For every clade, ccp = partition occurrences / their sum, which
    /// equals the clade's own occurrence count whenever the clade was
    /// observed as an internal vertex.
    pub fn initialize(&mut self) {
        for clade in &mut self.clades {
            let total: usize = clade.partitions.iter().map(|p| p.occurrence_count).sum();
            if !clade.partitions.is_empty() {
                debug_assert_eq!(
                    total, clade.occurrence_count,
                    "partition occurrences must sum to the parent clade's"
                );
            }
            for p in &mut clade.partitions {
                if total > 0 && p.occurrence_count > 0 {
                    p.ccp = p.occurrence_count as f64 / total as f64;
                    p.log_ccp = p.ccp.ln();
                } else {
                    p.ccp = 0.0;
                    p.log_ccp = f64::NEG_INFINITY;
                }
            }
        }
        self.ccps_dirty = false;
    }

    fn ensure_ccps(&mut self) {
        if self.ccps_dirty {
            self.initialize();
        }
    }

    /// Propagate marginal clade probabilities from the root.
    ///
    /// BFS in which a clade dequeues only after every parent has pushed
    /// its contribution, tracked by a per-clade visit count. Accumulated
    /// values in `(1, 1+1e-5]` are rounding noise and clip to 1.
    fn ensure_probabilities(&mut self) {
        self.ensure_ccps();
        if !self.probabilities_dirty {
            return;
        }
        let n = self.clades.len();
        let mut prob = vec![0.0f64; n];
        let mut visits = vec![0usize; n];
        prob[self.root] = 1.0;

        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        while let Some(id) = queue.pop_front() {
            let parent_prob = prob[id];
            for p in &self.clades[id].partitions {
                let contribution = parent_prob * p.ccp;
                prob[p.child1] += contribution;
                prob[p.child2] += contribution;
            }
            for &child in &self.clades[id].child_clades {
                visits[child] += 1;
                if visits[child] == self.clades[child].parent_clades.len() {
                    queue.push_back(child);
                }
            }
        }

        for (clade, p) in self.clades.iter_mut().zip(prob) {
            let clipped = if p > 1.0 && p <= 1.0 + PROBABILITY_CLIP {
                1.0
            } else {
                p
            };
            clade.probability = Some(clipped);
        }
        self.probabilities_dirty = false;
    }

    /// Marginal probability of the clade with the given bitset, if it
    /// was ever observed.
    pub fn clade_probability(&mut self, bits: &Bitset) -> Option<f64> {
        self.ensure_probabilities();
        let id = self.clade_id_of(bits)?;
        self.clades[id].probability
    }

    /// Non-leaf, non-root clades with the highest marginal probability.
    pub fn top_clades(&mut self, limit: usize) -> Vec<CladeId> {
        self.ensure_probabilities();
        let root = self.root;
        let mut ids: Vec<CladeId> = (0..self.clades.len())
            .filter(|&id| id != root && !self.clades[id].is_leaf())
            .collect();
        ids.sort_by(|&a, &b| {
            let pa = self.clades[a].probability.unwrap_or(0.0);
            let pb = self.clades[b].probability.unwrap_or(0.0);
            pb.total_cmp(&pa)
                .then_with(|| self.clades[a].bits.cmp(&self.clades[b].bits))
        });
        ids.truncate(limit);
        ids
    }

    /// Phylogenetic entropy, forward form: −Σ over partitions of
    /// parent probability · ccp · ln ccp.
    pub fn entropy(&mut self) -> f64 {
        never_cancelled(self.entropy_with_progress(&mut |_, _| true))
    }

    /// As [`Ccd::entropy`], reporting `(clades done, clades total)` every
    /// [`PROGRESS_CLADE_INTERVAL`] clades; a `false` return cancels with
    /// [`Error::Cancelled`] and leaves no cache behind.
    pub fn entropy_with_progress(
        &mut self,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> Result<f64> {
        self.ensure_probabilities();
        if let Some(h) = self.cached_entropy {
            return Ok(h);
        }
        let total = self.clades.len();
        let mut next_yield = 0usize;
        let mut h = 0.0;
        for (done, clade) in self.clades.iter().enumerate() {
            if done >= next_yield {
                if !progress(done, total) {
                    return Err(Error::Cancelled);
                }
                next_yield = done + PROGRESS_CLADE_INTERVAL;
            }
            let parent_prob = clade.probability.unwrap_or(0.0);
            for p in &clade.partitions {
                if p.ccp > 0.0 {
                    h -= parent_prob * p.ccp * p.log_ccp;
                }
            }
        }
        self.cached_entropy = Some(h);
        self.entropy_dirty = false;
        Ok(h)
    }

    /// Phylogenetic entropy, Lewis recursive form:
    /// H(leaf) = 0; H(C) = Σ_p ccp · (H(c₁) + H(c₂) − ln ccp).
    ///
    /// Agrees with [`Ccd::entropy`] when the DAG is a tree; the forms
    /// differ when clades have multiple parents, which is why both are
    /// exposed.
    pub fn entropy_lewis(&mut self) -> f64 {
        never_cancelled(self.entropy_lewis_with_progress(&mut |_, _| true))
    }

    /// As [`Ccd::entropy_lewis`], reporting `(clades done, clades total)`
    /// every [`PROGRESS_CLADE_INTERVAL`] resolved clades; a `false` return
    /// cancels with [`Error::Cancelled`] and leaves no cache behind.
    pub fn entropy_lewis_with_progress(
        &mut self,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> Result<f64> {
        self.ensure_ccps();
        if let Some(h) = self.cached_entropy_lewis {
            return Ok(h);
        }
        let n = self.clades.len();
        let mut memo: Vec<Option<f64>> = vec![None; n];
        let mut done = 0usize;
        let mut next_yield = 0usize;

        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if done >= next_yield {
                if !progress(done, n) {
                    return Err(Error::Cancelled);
                }
                next_yield = done + PROGRESS_CLADE_INTERVAL;
            }
            if memo[id].is_some() {
                continue;
            }
            if self.clades[id].is_leaf() {
                memo[id] = Some(0.0);
                done += 1;
                continue;
            }
            if !expanded {
                stack.push((id, true));
                for p in &self.clades[id].partitions {
                    if memo[p.child1].is_none() {
                        stack.push((p.child1, false));
                    }
                    if memo[p.child2].is_none() {
                        stack.push((p.child2, false));
                    }
                }
            } else {
                let mut h = 0.0;
                for p in &self.clades[id].partitions {
                    if p.ccp > 0.0 {
                        h += p.ccp
                            * (memo[p.child1].unwrap_or(0.0) + memo[p.child2].unwrap_or(0.0)
                                - p.log_ccp);
                    }
                }
                memo[id] = Some(h);
                done += 1;
            }
        }

        for (clade, m) in self.clades.iter_mut().zip(&memo) {
            clade.entropy = *m;
        }
        let h = memo[self.root].unwrap_or(0.0);
        self.cached_entropy_lewis = Some(h);
        self.entropy_dirty = false;
        Ok(h)
    }

    /// Log-probability of the most probable topology in the CCD.
    ///
    /// Iterative relaxation: leaves start at 0; a clade resolves once the
    /// children of all its viable partitions have values, taking
    /// max over partitions of ln ccp + both child values. A clade with no
    /// viable partition has no topology below it; it logs a warning and
    /// resolves to −∞.
    pub fn max_log_tree_probability(&mut self) -> f64 {
        never_cancelled(self.max_log_tree_probability_with_progress(&mut |_, _| true))
    }

    /// As [`Ccd::max_log_tree_probability`], reporting `(clades done,
    /// clades total)` every [`PROGRESS_CLADE_INTERVAL`] resolved clades; a
    /// `false` return cancels with [`Error::Cancelled`] and leaves no
    /// cache behind.
    pub fn max_log_tree_probability_with_progress(
        &mut self,
        progress: &mut dyn FnMut(usize, usize) -> bool,
    ) -> Result<f64> {
        self.ensure_ccps();
        if let Some(v) = self.cached_max_log {
            return Ok(v);
        }
        let n = self.clades.len();
        let mut value: Vec<Option<f64>> = vec![None; n];
        let mut argmax: Vec<Option<usize>> = vec![None; n];
        for (id, clade) in self.clades.iter().enumerate() {
            if clade.is_leaf() {
                value[id] = Some(0.0);
            }
        }
        let mut done = value.iter().filter(|v| v.is_some()).count();
        let mut next_yield = 0usize;

        loop {
            let mut changed = false;
            for id in 0..n {
                if done >= next_yield {
                    if !progress(done, n) {
                        return Err(Error::Cancelled);
                    }
                    next_yield = done + PROGRESS_CLADE_INTERVAL;
                }
                if value[id].is_some() {
                    continue;
                }
                let clade = &self.clades[id];
                let ready = clade.partitions.iter().all(|p| {
                    p.ccp <= 0.0 || (value[p.child1].is_some() && value[p.child2].is_some())
                });
                if !ready {
                    continue;
                }
                let mut best: Option<(f64, usize)> = None;
                for (pidx, p) in clade.partitions.iter().enumerate() {
                    if p.ccp <= 0.0 {
                        continue;
                    }
                    let candidate = p.log_ccp
                        + value[p.child1].unwrap_or(f64::NEG_INFINITY)
                        + value[p.child2].unwrap_or(f64::NEG_INFINITY);
                    if best.is_none_or(|(b, _)| candidate > b) {
                        best = Some((candidate, pidx));
                    }
                }
                match best {
                    Some((v, pidx)) => {
                        value[id] = Some(v);
                        argmax[id] = Some(pidx);
                    }
                    None => {
                        log::warn!(
                            "clade {} has no viable partition; its subtree probability is 0",
                            self.clade_label(id)
                        );
                        value[id] = Some(f64::NEG_INFINITY);
                    }
                }
                changed = true;
                done += 1;
            }
            if !changed {
                break;
            }
        }

        for id in 0..n {
            if value[id].is_none() {
                log::warn!(
                    "clade {} unreachable during max-probability search",
                    self.clade_label(id)
                );
                value[id] = Some(f64::NEG_INFINITY);
            }
        }

        for (clade, (v, a)) in self
            .clades
            .iter_mut()
            .zip(value.iter().zip(argmax.iter()))
        {
            clade.max_subtree_log_ccp = *v;
            clade.max_subtree_partition = *a;
        }
        let result = value[self.root].unwrap_or(f64::NEG_INFINITY);
        self.cached_max_log = Some(result);
        Ok(result)
    }

    /// Probability of the most probable topology, `exp` of the above.
    pub fn max_tree_probability(&mut self) -> f64 {
        self.max_log_tree_probability().exp()
    }

    /// Materialise the maximum-probability topology as a tree.
    ///
    /// Node heights are the clades' mean observed heights; branch lengths
    /// are parent−child height differences.
    pub fn max_probability_tree(&mut self) -> Result<Tree> {
        if self.num_base_trees == 0 {
            return Err(Error::InsufficientTrees {
                operation: "maximum-probability tree",
                needed: 1,
                got: 0,
            });
        }
        if self.max_log_tree_probability() == f64::NEG_INFINITY {
            return Err(Error::numeric(
                "no topology with positive probability in the CCD",
            ));
        }

        let mut tree = Tree::with_root(None, None);
        tree.node_mut(0).height = self.clades[self.root].mean_occurred_height();

        let mut stack = vec![(self.root, tree.root())];
        while let Some((clade_id, node_id)) = stack.pop() {
            let clade = &self.clades[clade_id];
            if clade.is_leaf() {
                continue;
            }
            let Some(pidx) = clade.max_subtree_partition else {
                return Err(Error::numeric(format!(
                    "clade {} has no selected partition",
                    self.clade_label(clade_id)
                )));
            };
            let partition = &clade.partitions[pidx];
            let parent_height = clade.mean_occurred_height();
            for child_id in [partition.child1, partition.child2] {
                let child = &self.clades[child_id];
                let label = if child.is_leaf() {
                    child
                        .bits
                        .next_set_bit(0)
                        .map(|bit| self.taxa.label_of(bit).to_string())
                } else {
                    None
                };
                let child_height = child.mean_occurred_height();
                let node =
                    tree.add_child(node_id, label, Some(parent_height - child_height));
                tree.node_mut(node).height = child_height;
                stack.push((child_id, node));
            }
        }
        Ok(tree)
    }

    /// Log-probability of one tree under the CCD.
    ///
    /// Post-order lookup of each vertex's clade and split; any clade or
    /// partition the CCD never observed makes the probability 0 (−∞).
    pub fn tree_log_probability(&mut self, tree: &Tree) -> Result<f64> {
        self.ensure_ccps();
        let num_bits = self.taxa.len();
        let order = tree.postorder();

        let mut node_bits: Vec<Bitset> = vec![Bitset(Vec::new()); tree.len()];
        let mut node_clade: Vec<CladeId> = vec![0; tree.len()];
        let mut log_p = 0.0;

        for &id in &order {
            let node = tree.node(id);
            match node.children.len() {
                0 => {
                    let label = tree.leaf_label(id);
                    let bit = self.taxa.bit_of(&label).ok_or_else(|| Error::TaxonUnknown {
                        label,
                        known: num_bits,
                    })?;
                    let bits = Bitset::singleton(num_bits, bit);
                    match self.clade_ids.get(&bits) {
                        Some(&cid) => node_clade[id] = cid,
                        None => return Ok(f64::NEG_INFINITY),
                    }
                    node_bits[id] = bits;
                }
                2 => {
                    let mut bits = node_bits[node.children[0]].clone();
                    bits.or_assign(&node_bits[node.children[1]]);
                    let Some(&cid) = self.clade_ids.get(&bits) else {
                        return Ok(f64::NEG_INFINITY);
                    };
                    let c1 = node_clade[node.children[0]];
                    let c2 = node_clade[node.children[1]];
                    match self.clades[cid].find_partition(c1, c2) {
                        Some(pidx) => log_p += self.clades[cid].partitions[pidx].log_ccp,
                        None => return Ok(f64::NEG_INFINITY),
                    }
                    node_clade[id] = cid;
                    node_bits[id] = bits;
                }
                n => {
                    return Err(Error::malformed(format!(
                        "internal node {id} has {n} children; trees must be strictly binary"
                    )));
                }
            }
        }
        Ok(log_p)
    }

    /// Number of distinct topologies the CCD assigns nonzero probability.
    ///
    /// Product-sum over the DAG: leaves count 1, a clade counts
    /// Σ over partitions of count(c₁)·count(c₂).
    pub fn number_of_topologies(&mut self) -> f64 {
        self.ensure_ccps();
        if let Some(c) = self.cached_topology_count {
            return c;
        }
        let n = self.clades.len();
        let mut memo: Vec<Option<f64>> = vec![None; n];

        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if memo[id].is_some() {
                continue;
            }
            if self.clades[id].is_leaf() {
                memo[id] = Some(1.0);
                continue;
            }
            if !expanded {
                stack.push((id, true));
                for p in &self.clades[id].partitions {
                    if memo[p.child1].is_none() {
                        stack.push((p.child1, false));
                    }
                    if memo[p.child2].is_none() {
                        stack.push((p.child2, false));
                    }
                }
            } else {
                let count = self.clades[id]
                    .partitions
                    .iter()
                    .map(|p| memo[p.child1].unwrap_or(0.0) * memo[p.child2].unwrap_or(0.0))
                    .sum();
                memo[id] = Some(count);
            }
        }

        let count = memo[self.root].unwrap_or(0.0);
        self.cached_topology_count = Some(count);
        self.topology_count_dirty = false;
        count
    }
}

/// Unwraps a computation run with the always-continue progress hook.
fn never_cancelled(result: Result<f64>) -> f64 {
    match result {
        Ok(value) => value,
        Err(_) => unreachable!("no-op progress hook cannot cancel"),
    }
}

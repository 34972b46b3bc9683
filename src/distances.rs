//! Tree distance metrics using bitset-based snapshots.
//!
//! This module implements three distance measures between rooted trees:
//!
//! 1. **Robinson-Foulds (RF)**: counts the bipartitions that differ
//!    between two trees.
//! 2. **SPR (approximate)**: ⌈RF/2⌉, a lower bound on the true
//!    subtree-prune-regraft distance. The exact SPR distance is
//!    deliberately not computed.
//! 3. **Path difference**: mean absolute difference of leaf-to-leaf path
//!    lengths over the leaf pairs both trees share.
//!
//! Each tree is first summarised into an immutable snapshot (its
//! canonicalised splits, or its leaf-pair path lengths) so that the O(n²)
//! pairwise comparisons never re-walk the trees.

use crate::bitset::Bitset;
use crate::error::{Error, Result};
use crate::tree::{NodeId, Tree};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Distance metric selector for matrix construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    RobinsonFoulds,
    Spr,
    Path,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::RobinsonFoulds => f.write_str("rf"),
            Metric::Spr => f.write_str("spr"),
            Metric::Path => f.write_str("path"),
        }
    }
}

/// Number of matrix columns between progress reports.
pub const PROGRESS_COLUMN_INTERVAL: usize = 10;

/// An immutable snapshot of the non-trivial splits of one tree.
///
/// # Canonicalisation
/// Each bipartition can be written from either side. The stored side is
/// the one **not** containing leaf 0 (the lexicographically first taxon),
/// so identical bipartitions from different trees produce identical
/// bitsets. Splits come from internal non-root nodes only; leaf splits are
/// trivial and the root split is empty on one side, so both are skipped.
#[derive(Debug, Clone)]
pub struct TreeSplits {
    /// Canonical splits (HashSet for O(1) membership in the RF kernel).
    pub splits: HashSet<Bitset>,
    /// Total number of leaves, needed for computing complements.
    pub num_leaves: usize,
}

impl TreeSplits {
    /// Extract the split snapshot from a tree.
    ///
    /// Leaves are sorted alphabetically by label so identical taxa always
    /// map to the same bit positions regardless of node ids.
    pub fn from_tree(tree: &Tree) -> Result<Self> {
        let leaf_index = sorted_leaf_index(tree);
        let num_leaves = leaf_index.len();
        let words = Bitset::words_for(num_leaves);

        let mut bits: HashMap<NodeId, Bitset> = HashMap::new();
        let mut splits = HashSet::new();
        let root = tree.root();

        for id in tree.postorder() {
            let node = tree.node(id);
            let bitset = if node.children.is_empty() {
                let mut bs = Bitset::zeros(words);
                let label = tree.leaf_label(id);
                let idx = leaf_index.get(&label).ok_or_else(|| {
                    Error::malformed(format!("leaf '{label}' missing from leaf index"))
                })?;
                bs.set(*idx);
                bs
            } else {
                let mut bs = Bitset::zeros(words);
                for &child in &node.children {
                    bs.or_assign(&bits[&child]);
                }
                bs
            };

            if id != root && !node.children.is_empty() {
                splits.insert(canonicalize(&bitset, words, num_leaves));
            }
            bits.insert(id, bitset);
        }

        Ok(TreeSplits { splits, num_leaves })
    }
}

/// Map sorted leaf labels to bit positions `[0, L)`.
fn sorted_leaf_index(tree: &Tree) -> HashMap<String, usize> {
    let mut labels = tree.tip_labels();
    labels.sort();
    labels
        .into_iter()
        .enumerate()
        .map(|(idx, label)| (label, idx))
        .collect()
}

/// Store the side of the split that does not contain leaf 0.
fn canonicalize(bitset: &Bitset, words: usize, num_leaves: usize) -> Bitset {
    if bitset.get(0) {
        complement(bitset, words, num_leaves)
    } else {
        bitset.clone()
    }
}

fn complement(bitset: &Bitset, words: usize, num_leaves: usize) -> Bitset {
    let mut out = Bitset::zeros(words);
    for i in 0..num_leaves {
        if !bitset.get(i) {
            out.set(i);
        }
    }
    out
}

/// Compute the Robinson-Foulds distance between two trees.
///
/// # Algorithm
/// RF = |A| + |B| - 2|A ∩ B| where A and B are the canonical split sets.
///
/// # Example
/// ```text
/// Tree 1: ((A,B),C)   splits: {A,B}
/// Tree 2: ((A,C),B)   splits: {A,C}
/// Intersection empty → RF = 1 + 1 - 0 = 2
/// ```
pub fn robinson_foulds(tree_a: &Tree, tree_b: &Tree) -> Result<usize> {
    let snap_a = TreeSplits::from_tree(tree_a)?;
    let snap_b = TreeSplits::from_tree(tree_b)?;
    Ok(rf_from_splits(&snap_a, &snap_b))
}

/// RF distance from two pre-computed split snapshots.
pub fn rf_from_splits(a: &TreeSplits, b: &TreeSplits) -> usize {
    let inter = a.splits.intersection(&b.splits).count();
    a.splits.len() + b.splits.len() - 2 * inter
}

/// Approximate SPR distance, defined as ⌈RF/2⌉.
///
/// This is a lower bound on the true SPR distance, kept as a contract.
pub fn spr_approx(tree_a: &Tree, tree_b: &Tree) -> Result<usize> {
    Ok(robinson_foulds(tree_a, tree_b)?.div_ceil(2))
}

/// Leaf-pair path lengths of one tree, keyed by sorted label pair.
#[derive(Debug, Clone)]
pub struct PathLengths {
    pub pairs: HashMap<(String, String), f64>,
}

impl PathLengths {
    /// Sum of branch lengths along every leaf-to-leaf path.
    ///
    /// The path a→b decomposes as a→MRCA(a,b) plus b→MRCA(a,b); a missing
    /// branch length counts as 1.
    pub fn from_tree(tree: &Tree) -> Self {
        let leaves = tree.leaves();

        // Distance from each leaf to every ancestor on its root path
        let ancestors: Vec<HashMap<NodeId, f64>> = leaves
            .iter()
            .map(|&leaf| {
                let mut dist = 0.0;
                let mut map = HashMap::new();
                map.insert(leaf, 0.0);
                let mut cur = leaf;
                while let Some(parent) = tree.node(cur).parent {
                    dist += tree.branch_length_or_default(cur);
                    map.insert(parent, dist);
                    cur = parent;
                }
                map
            })
            .collect();

        let mut pairs = HashMap::new();
        for i in 0..leaves.len() {
            for j in (i + 1)..leaves.len() {
                // Walk j's root path until it meets an ancestor of i
                let mut dist_j = 0.0;
                let mut cur = leaves[j];
                let total = loop {
                    if let Some(dist_i) = ancestors[i].get(&cur) {
                        break dist_i + dist_j;
                    }
                    dist_j += tree.branch_length_or_default(cur);
                    match tree.node(cur).parent {
                        Some(parent) => cur = parent,
                        // Unreachable in a connected tree; treat as no path
                        None => break f64::NAN,
                    }
                };
                pairs.insert(
                    pair_key(tree.leaf_label(leaves[i]), tree.leaf_label(leaves[j])),
                    total,
                );
            }
        }

        PathLengths { pairs }
    }
}

fn pair_key(a: String, b: String) -> (String, String) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Mean absolute difference of path lengths over shared leaf pairs.
///
/// Returns +∞ when the trees share no leaf pair.
pub fn path_distance(tree_a: &Tree, tree_b: &Tree) -> f64 {
    path_from_lengths(&PathLengths::from_tree(tree_a), &PathLengths::from_tree(tree_b))
}

/// Path distance from two pre-computed path-length snapshots.
pub fn path_from_lengths(a: &PathLengths, b: &PathLengths) -> f64 {
    let mut shared = 0usize;
    let mut total = 0.0;
    for (key, len_a) in &a.pairs {
        if let Some(len_b) = b.pairs.get(key) {
            shared += 1;
            total += (len_a - len_b).abs();
        }
    }
    if shared == 0 {
        f64::INFINITY
    } else {
        total / shared as f64
    }
}

enum Snapshots {
    Splits(Vec<TreeSplits>),
    Paths(Vec<PathLengths>),
}

impl Snapshots {
    fn build(trees: &[Tree], metric: Metric) -> Result<Self> {
        match metric {
            Metric::RobinsonFoulds | Metric::Spr => Ok(Snapshots::Splits(
                trees
                    .iter()
                    .map(TreeSplits::from_tree)
                    .collect::<Result<Vec<_>>>()?,
            )),
            Metric::Path => Ok(Snapshots::Paths(
                trees.iter().map(PathLengths::from_tree).collect(),
            )),
        }
    }

    fn distance(&self, metric: Metric, i: usize, j: usize) -> f64 {
        match self {
            Snapshots::Splits(snaps) => {
                let rf = rf_from_splits(&snaps[i], &snaps[j]);
                match metric {
                    Metric::Spr => rf.div_ceil(2) as f64,
                    _ => rf as f64,
                }
            }
            Snapshots::Paths(snaps) => path_from_lengths(&snaps[i], &snaps[j]),
        }
    }
}

/// Symmetric distance matrix with zero diagonal.
///
/// Only the `i < j` pairs are computed (in parallel) and mirrored.
pub fn distance_matrix(trees: &[Tree], metric: Metric) -> Result<Vec<Vec<f64>>> {
    let snaps = Snapshots::build(trees, metric)?;
    let n = trees.len();

    let pairs: Vec<(usize, usize, f64)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| (i + 1..n).map(move |j| (i, j)))
        .map(|(i, j)| (i, j, snaps.distance(metric, i, j)))
        .collect();

    let mut mat = vec![vec![0.0f64; n]; n];
    for (i, j, d) in pairs {
        mat[i][j] = d;
        mat[j][i] = d;
    }
    Ok(mat)
}

/// Serial matrix fill that reports progress and supports cancellation.
///
/// `progress(i, j, n)` is invoked before every `every`-th column; a
/// `false` return aborts with [`Error::Cancelled`]. The numeric result is
/// identical to [`distance_matrix`].
pub fn distance_matrix_with_progress(
    trees: &[Tree],
    metric: Metric,
    every: usize,
    progress: &mut dyn FnMut(usize, usize, usize) -> bool,
) -> Result<Vec<Vec<f64>>> {
    let snaps = Snapshots::build(trees, metric)?;
    let n = trees.len();
    let every = every.max(1);

    let mut mat = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        if i % every == 0 && !progress(i, i + 1, n) {
            return Err(Error::Cancelled);
        }
        for j in (i + 1)..n {
            let d = snaps.distance(metric, i, j);
            mat[i][j] = d;
            mat[j][i] = d;
        }
    }
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{Format, read_trees};
    use float_cmp::approx_eq;
    use itertools::Itertools;

    fn trees_of(newick: &str) -> Vec<Tree> {
        read_trees(newick, Format::Newick).unwrap()
    }

    #[test]
    fn identical_trees_have_zero_distance() {
        let trees = trees_of("((A,B),C);((A,B),C);");
        assert_eq!(robinson_foulds(&trees[0], &trees[1]).unwrap(), 0);
        assert_eq!(path_distance(&trees[0], &trees[1]), 0.0);
    }

    #[test]
    fn cherry_swap_has_rf_two_spr_one() {
        let trees = trees_of("((A,B),C);((A,C),B);");
        assert_eq!(robinson_foulds(&trees[0], &trees[1]).unwrap(), 2);
        assert_eq!(spr_approx(&trees[0], &trees[1]).unwrap(), 1);
    }

    #[test]
    fn rf_is_symmetric_and_nonnegative() {
        let trees = trees_of("((A,(B,D)),C);((A,C),(B,D));((A,B),(C,D));");
        for pair in (0..trees.len()).combinations(2) {
            let (a, b) = (&trees[pair[0]], &trees[pair[1]]);
            let ab = robinson_foulds(a, b).unwrap();
            let ba = robinson_foulds(b, a).unwrap();
            assert_eq!(ab, ba);
            assert!(ab > 0);
        }
        for tree in &trees {
            assert_eq!(robinson_foulds(tree, tree).unwrap(), 0);
        }
    }

    #[test]
    fn path_distance_known_value() {
        // Pairwise paths tree 1: A-B = 2, A-C = 4, B-C = 4
        // Pairwise paths tree 2: A-B = 4, A-C = 2, B-C = 4
        let trees = trees_of("((A:1,B:1):1,C:2);((A:1,C:1):1,B:2);");
        let d = path_distance(&trees[0], &trees[1]);
        // |2-4| + |4-2| + |4-4| over 3 pairs
        assert!(approx_eq!(f64, d, 4.0 / 3.0, epsilon = 1e-12));
        assert!(approx_eq!(
            f64,
            path_distance(&trees[1], &trees[0]),
            d,
            epsilon = 1e-15
        ));
    }

    #[test]
    fn path_distance_defaults_missing_lengths_to_one() {
        let trees = trees_of("((A,B),C);((A,B),C);");
        // Identical trees, identical default lengths
        assert_eq!(path_distance(&trees[0], &trees[1]), 0.0);
        let lengths = PathLengths::from_tree(&trees[0]);
        let ab = lengths.pairs[&("A".to_string(), "B".to_string())];
        assert_eq!(ab, 2.0);
    }

    #[test]
    fn disjoint_leaf_sets_have_infinite_path_distance() {
        let trees = trees_of("((A,B),C);((X,Y),Z);");
        assert!(path_distance(&trees[0], &trees[1]).is_infinite());
    }

    #[test]
    fn matrix_is_symmetric_with_zero_diagonal() {
        let trees = trees_of("((A,B),(C,D));((A,C),(B,D));((A,D),(B,C));");
        for metric in [Metric::RobinsonFoulds, Metric::Spr, Metric::Path] {
            let mat = distance_matrix(&trees, metric).unwrap();
            for i in 0..trees.len() {
                assert_eq!(mat[i][i], 0.0);
                for j in 0..trees.len() {
                    assert_eq!(mat[i][j], mat[j][i]);
                }
            }
        }
    }

    #[test]
    fn progress_variant_matches_parallel_fill() {
        let trees = trees_of("((A,B),(C,D));((A,C),(B,D));((A,D),(B,C));((A,B),(C,D));");
        let parallel = distance_matrix(&trees, Metric::RobinsonFoulds).unwrap();
        let mut calls = 0;
        let serial = distance_matrix_with_progress(
            &trees,
            Metric::RobinsonFoulds,
            1,
            &mut |_i, _j, n| {
                assert_eq!(n, 4);
                calls += 1;
                true
            },
        )
        .unwrap();
        assert_eq!(parallel, serial);
        assert_eq!(calls, 4);
    }

    #[test]
    fn progress_callback_can_cancel() {
        let trees = trees_of("((A,B),C);((A,C),B);");
        let err = distance_matrix_with_progress(
            &trees,
            Metric::RobinsonFoulds,
            1,
            &mut |_, _, _| false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}

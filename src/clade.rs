//! Vertices and hyperedges of the conditional clade DAG.
//!
//! A [`Clade`] is a set of taxa observed as a subtree in at least one
//! input tree (the root clade exists from the start). A
//! [`CladePartition`] records one observed way of splitting a clade into
//! two disjoint child clades. Clades are deduplicated by bitset and refer
//! to each other through arena ids, so the many-to-many parent/child
//! relation never forms an ownership cycle.

use crate::bitset::Bitset;
use std::collections::BTreeSet;

/// Index of a clade within its CCD's arena.
pub type CladeId = usize;

/// One observed split of a parent clade into two disjoint child clades.
///
/// The pair is unordered semantically; `child1`/`child2` are normalised
/// to ascending id so lookups compare a single representation.
#[derive(Debug, Clone)]
pub struct CladePartition {
    pub child1: CladeId,
    pub child2: CladeId,
    /// Number of input trees containing this split.
    pub occurrence_count: usize,
    /// Sum of the splitting node's heights across occurrences.
    pub sum_occurred_heights: f64,
    /// Conditional clade probability: occurrences over the parent's.
    pub ccp: f64,
    /// ln(ccp), or −∞ when ccp is 0.
    pub log_ccp: f64,
}

impl CladePartition {
    pub fn new(a: CladeId, b: CladeId) -> Self {
        let (child1, child2) = if a <= b { (a, b) } else { (b, a) };
        CladePartition {
            child1,
            child2,
            occurrence_count: 0,
            sum_occurred_heights: 0.0,
            ccp: 0.0,
            log_ccp: f64::NEG_INFINITY,
        }
    }

    /// Unordered match against a candidate child pair.
    pub fn matches(&self, a: CladeId, b: CladeId) -> bool {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.child1 == lo && self.child2 == hi
    }

    pub fn mean_occurred_height(&self) -> f64 {
        if self.occurrence_count == 0 {
            0.0
        } else {
            self.sum_occurred_heights / self.occurrence_count as f64
        }
    }
}

/// A vertex of the conditional clade DAG.
#[derive(Debug, Clone)]
pub struct Clade {
    /// Taxon membership; the clade's identity within its CCD.
    pub bits: Bitset,
    /// Number of input trees in which this clade appears.
    pub occurrence_count: usize,
    /// Sum of node heights across occurrences.
    pub sum_occurred_heights: f64,
    /// Observed splits of this clade, in first-seen order.
    pub partitions: Vec<CladePartition>,
    /// Clades of which this one is a child in some partition.
    pub parent_clades: BTreeSet<CladeId>,
    /// Union of children over all of this clade's partitions.
    pub child_clades: BTreeSet<CladeId>,

    // Cached quantities; `None` means not yet computed for the current
    // tree multiset. Maintained by the owning CCD.
    pub(crate) probability: Option<f64>,
    pub(crate) entropy: Option<f64>,
    pub(crate) max_subtree_log_ccp: Option<f64>,
    pub(crate) max_subtree_partition: Option<usize>,
}

impl Clade {
    pub fn new(bits: Bitset) -> Self {
        Clade {
            bits,
            occurrence_count: 0,
            sum_occurred_heights: 0.0,
            partitions: Vec::new(),
            parent_clades: BTreeSet::new(),
            child_clades: BTreeSet::new(),
            probability: None,
            entropy: None,
            max_subtree_log_ccp: None,
            max_subtree_partition: None,
        }
    }

    /// A clade is a leaf iff it contains exactly one taxon.
    pub fn is_leaf(&self) -> bool {
        self.bits.count_ones() == 1
    }

    /// Number of taxa in the clade.
    pub fn size(&self) -> usize {
        self.bits.count_ones()
    }

    /// Marginal probability, if propagation has run.
    pub fn probability(&self) -> Option<f64> {
        self.probability
    }

    /// Subtree entropy in the Lewis recursion, if computed.
    pub fn entropy(&self) -> Option<f64> {
        self.entropy
    }

    /// Best achievable subtree log-probability, if computed.
    pub fn max_subtree_log_ccp(&self) -> Option<f64> {
        self.max_subtree_log_ccp
    }

    /// Partition realising [`Clade::max_subtree_log_ccp`], if computed.
    pub fn max_subtree_partition(&self) -> Option<usize> {
        self.max_subtree_partition
    }

    pub fn mean_occurred_height(&self) -> f64 {
        if self.occurrence_count == 0 {
            0.0
        } else {
            self.sum_occurred_heights / self.occurrence_count as f64
        }
    }

    /// Index of the partition with the given unordered child pair.
    pub fn find_partition(&self, a: CladeId, b: CladeId) -> Option<usize> {
        self.partitions.iter().position(|p| p.matches(a, b))
    }

    pub(crate) fn clear_caches(&mut self) {
        self.probability = None;
        self.entropy = None;
        self.max_subtree_log_ccp = None;
        self.max_subtree_partition = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_pair_is_normalised() {
        let p = CladePartition::new(7, 3);
        assert_eq!((p.child1, p.child2), (3, 7));
        assert!(p.matches(3, 7));
        assert!(p.matches(7, 3));
        assert!(!p.matches(3, 8));
    }

    #[test]
    fn leaf_iff_single_taxon() {
        let mut bits = Bitset::with_bits(4);
        bits.set(2);
        let clade = Clade::new(bits.clone());
        assert!(clade.is_leaf());
        bits.set(3);
        assert!(!Clade::new(bits).is_leaf());
    }

    #[test]
    fn mean_height_counts_occurrences() {
        let mut clade = Clade::new(Bitset::with_bits(4));
        assert_eq!(clade.mean_occurred_height(), 0.0);
        clade.occurrence_count = 2;
        clade.sum_occurred_heights = 3.0;
        assert_eq!(clade.mean_occurred_height(), 1.5);
    }
}

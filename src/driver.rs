//! High-level pipelines: trees → distances → MDS, trees → CCD →
//! statistics, trees → splits → dissonance.
//!
//! Every entry point takes already-parsed trees; reading files is the
//! caller's business (the CLI uses [`crate::reader`]).

use crate::ccd::{Ccd, TaxonIndex};
use crate::distances::{self, Metric, PROGRESS_COLUMN_INTERVAL};
use crate::error::{Error, Result};
use crate::mds;
use crate::tree::Tree;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

pub use crate::dissonance::within_chain_dissonance;

/// Ceiling on the trees fed into the distance matrix by default.
pub const DEFAULT_MAX_MDS_TREES: usize = 500;

/// What the MDS pipeline did, for reporting alongside the coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct MdsSummary {
    pub metric: Metric,
    pub input_trees: usize,
    pub burnin_discarded: usize,
    pub analyzed_trees: usize,
    /// Top two eigenvalues of the double-centred matrix.
    pub eigenvalues: [f64; 2],
}

/// Output of [`mds_pipeline`].
#[derive(Debug, Clone)]
pub struct MdsRun {
    pub distances: Vec<Vec<f64>>,
    pub coords: Vec<[f64; 2]>,
    /// `Tree {original index + 1}` per analysed tree.
    pub labels: Vec<String>,
    pub summary: MdsSummary,
}

/// Distance matrix and 2D embedding of a tree sample.
///
/// After removing the first `burnin_pct` percent, at most `max_trees`
/// trees are kept — chosen by a seeded partial Fisher–Yates shuffle and
/// re-sorted into their original order, so labels are stable for a given
/// seed. `progress(i, j, n)` follows the distance-matrix column schedule.
pub fn mds_pipeline(
    trees: &[Tree],
    metric: Metric,
    max_trees: usize,
    burnin_pct: f64,
    seed: u64,
    progress: Option<&mut dyn FnMut(usize, usize, usize) -> bool>,
) -> Result<MdsRun> {
    let burnin_discarded = ((trees.len() as f64) * burnin_pct / 100.0).floor() as usize;
    let burnin_discarded = burnin_discarded.min(trees.len());
    let mut indices: Vec<usize> = (burnin_discarded..trees.len()).collect();

    if max_trees > 0 && indices.len() > max_trees {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        // Partial Fisher–Yates: only the first `max_trees` slots are drawn
        for i in 0..max_trees {
            let j = rng.gen_range(i..indices.len());
            indices.swap(i, j);
        }
        indices.truncate(max_trees);
        indices.sort_unstable();
    }

    if indices.len() < 2 {
        return Err(Error::InsufficientTrees {
            operation: "MDS",
            needed: 2,
            got: indices.len(),
        });
    }

    let selected: Vec<Tree> = indices.iter().map(|&i| trees[i].clone()).collect();
    let labels: Vec<String> = indices.iter().map(|&i| format!("Tree {}", i + 1)).collect();

    let matrix = match progress {
        Some(cb) => distances::distance_matrix_with_progress(
            &selected,
            metric,
            PROGRESS_COLUMN_INTERVAL,
            cb,
        )?,
        None => distances::distance_matrix(&selected, metric)?,
    };

    let n = matrix.len();
    let array = Array2::from_shape_fn((n, n), |(i, j)| matrix[i][j]);
    let embedding = mds::classical_mds(&array)?;

    Ok(MdsRun {
        distances: matrix,
        coords: embedding.coords,
        labels,
        summary: MdsSummary {
            metric,
            input_trees: trees.len(),
            burnin_discarded,
            analyzed_trees: n,
            eigenvalues: embedding.eigenvalues,
        },
    })
}

/// Build a CCD from a tree sample after discarding a burn-in fraction.
pub fn build_ccd_from_trees(trees: &[Tree], burnin_fraction: f64) -> Result<Ccd> {
    build_ccd(trees, burnin_fraction, None)
}

/// As [`build_ccd_from_trees`], reporting `(trees done, trees total)`
/// between ingestions. The callback may cancel; a cancelled build is
/// abandoned and the partial CCD dropped.
pub fn build_ccd_from_trees_with_progress(
    trees: &[Tree],
    burnin_fraction: f64,
    progress: &mut dyn FnMut(usize, usize) -> bool,
) -> Result<Ccd> {
    build_ccd(trees, burnin_fraction, Some(progress))
}

fn build_ccd(
    trees: &[Tree],
    burnin_fraction: f64,
    mut progress: Option<&mut dyn FnMut(usize, usize) -> bool>,
) -> Result<Ccd> {
    let discard = ((trees.len() as f64) * burnin_fraction).floor() as usize;
    let discard = discard.min(trees.len());
    let retained = &trees[discard..];
    if retained.is_empty() {
        return Err(Error::InsufficientTrees {
            operation: "CCD construction",
            needed: 1,
            got: 0,
        });
    }

    let mut ccd = Ccd::new(TaxonIndex::from_trees(retained));
    let total = retained.len();
    for (done, tree) in retained.iter().enumerate() {
        if let Some(cb) = progress.as_mut() {
            if !cb(done, total) {
                return Err(Error::Cancelled);
            }
        }
        ccd.add_tree(tree)?;
    }
    ccd.initialize();
    Ok(ccd)
}

/// One reported high-probability clade.
#[derive(Debug, Clone, Serialize)]
pub struct CladeReport {
    pub taxa: Vec<String>,
    pub probability: f64,
    pub occurrences: usize,
    pub mean_height: f64,
}

/// Summary statistics of a CCD.
#[derive(Debug, Clone, Serialize)]
pub struct CcdStatistics {
    pub number_of_trees: usize,
    pub number_of_clades: usize,
    pub number_of_leaves: usize,
    pub entropy: f64,
    pub entropy_lewis: f64,
    pub max_log_tree_probability: f64,
    pub max_tree_probability: f64,
    pub number_of_topologies: f64,
    /// Up to ten non-leaf, non-root clades by marginal probability.
    pub top_clades: Vec<CladeReport>,
}

/// Derived statistics of a CCD, including its ten most probable clades.
pub fn ccd_statistics(ccd: &mut Ccd) -> CcdStatistics {
    match ccd_statistics_with_progress(ccd, &mut |_, _| true) {
        Ok(stats) => stats,
        Err(_) => unreachable!("no-op progress hook cannot cancel"),
    }
}

/// As [`ccd_statistics`], threading `progress(clades done, clades total)`
/// through the entropy and max-probability passes; a `false` return
/// cancels with [`crate::Error::Cancelled`].
pub fn ccd_statistics_with_progress(
    ccd: &mut Ccd,
    progress: &mut dyn FnMut(usize, usize) -> bool,
) -> Result<CcdStatistics> {
    let entropy = ccd.entropy_with_progress(&mut *progress)?;
    let entropy_lewis = ccd.entropy_lewis_with_progress(&mut *progress)?;
    let max_log_tree_probability = ccd.max_log_tree_probability_with_progress(progress)?;

    let top_clades = ccd
        .top_clades(10)
        .into_iter()
        .map(|id| {
            let clade = ccd.clade(id);
            CladeReport {
                taxa: clade.bits.ones().map(|b| ccd.taxa().label_of(b).to_string()).collect(),
                probability: clade.probability().unwrap_or(0.0),
                occurrences: clade.occurrence_count,
                mean_height: clade.mean_occurred_height(),
            }
        })
        .collect();

    Ok(CcdStatistics {
        number_of_trees: ccd.num_base_trees(),
        number_of_clades: ccd.num_clades(),
        number_of_leaves: ccd.num_leaves(),
        entropy,
        entropy_lewis,
        max_log_tree_probability,
        max_tree_probability: max_log_tree_probability.exp(),
        number_of_topologies: ccd.number_of_topologies(),
        top_clades,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{Format, read_trees};
    use float_cmp::approx_eq;

    fn trees_of(newick: &str) -> Vec<Tree> {
        read_trees(newick, Format::Newick).unwrap()
    }

    #[test]
    fn mds_pipeline_shapes_and_labels() {
        let trees = trees_of("((A,B),C);((A,C),B);((B,C),A);");
        let run = mds_pipeline(&trees, Metric::RobinsonFoulds, 0, 0.0, 42, None).unwrap();
        assert_eq!(run.distances.len(), 3);
        assert_eq!(run.coords.len(), 3);
        assert_eq!(run.labels, vec!["Tree 1", "Tree 2", "Tree 3"]);
        assert_eq!(run.summary.analyzed_trees, 3);
        assert_eq!(run.summary.burnin_discarded, 0);
        for i in 0..3 {
            assert_eq!(run.distances[i][i], 0.0);
        }
    }

    #[test]
    fn mds_pipeline_burnin_and_sampling_are_deterministic() {
        let trees: Vec<Tree> = (0..10)
            .flat_map(|i| {
                if i % 2 == 0 {
                    trees_of("((A,B),C);")
                } else {
                    trees_of("((A,C),B);")
                }
            })
            .collect();
        let run_a = mds_pipeline(&trees, Metric::RobinsonFoulds, 4, 20.0, 7, None).unwrap();
        let run_b = mds_pipeline(&trees, Metric::RobinsonFoulds, 4, 20.0, 7, None).unwrap();
        assert_eq!(run_a.labels, run_b.labels);
        assert_eq!(run_a.summary.burnin_discarded, 2);
        assert_eq!(run_a.summary.analyzed_trees, 4);
        // Burn-in trees can never be sampled
        for label in &run_a.labels {
            let idx: usize = label.strip_prefix("Tree ").unwrap().parse().unwrap();
            assert!(idx > 2);
        }
        // Labels stay ascending after the shuffle
        let mut sorted = run_a.labels.clone();
        sorted.sort_by_key(|l| l.strip_prefix("Tree ").unwrap().parse::<usize>().unwrap());
        assert_eq!(sorted, run_a.labels);
    }

    #[test]
    fn mds_pipeline_rejects_single_tree() {
        let trees = trees_of("((A,B),C);");
        let err = mds_pipeline(&trees, Metric::RobinsonFoulds, 0, 0.0, 42, None).unwrap_err();
        assert!(matches!(err, Error::InsufficientTrees { .. }));
    }

    #[test]
    fn mds_pipeline_progress_can_cancel() {
        let trees = trees_of("((A,B),C);((A,C),B);");
        let err = mds_pipeline(
            &trees,
            Metric::RobinsonFoulds,
            0,
            0.0,
            42,
            Some(&mut |_, _, _| false),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn build_ccd_discards_burnin() {
        let trees = trees_of("((A,C),B);((A,C),B);((A,B),C);((A,B),C);");
        let mut ccd = build_ccd_from_trees(&trees, 0.5).unwrap();
        assert_eq!(ccd.num_base_trees(), 2);
        // Only the post-burnin topology remains
        assert!(ccd.entropy().abs() <= 1e-12);
    }

    #[test]
    fn build_ccd_progress_counts_trees() {
        let trees = trees_of("((A,B),C);((A,C),B);((B,C),A);");
        let mut seen = Vec::new();
        let ccd = build_ccd_from_trees_with_progress(&trees, 0.0, &mut |done, total| {
            seen.push((done, total));
            true
        })
        .unwrap();
        assert_eq!(ccd.num_base_trees(), 3);
        assert_eq!(seen, vec![(0, 3), (1, 3), (2, 3)]);
    }

    #[test]
    fn statistics_reflect_the_sample() {
        let trees = trees_of("((A,B),C);((A,B),C);((A,C),B);");
        let mut ccd = build_ccd_from_trees(&trees, 0.0).unwrap();
        let stats = ccd_statistics(&mut ccd);
        assert_eq!(stats.number_of_trees, 3);
        assert_eq!(stats.number_of_leaves, 3);
        assert!(approx_eq!(f64, stats.max_tree_probability, 2.0 / 3.0, epsilon = 1e-12));
        assert_eq!(stats.number_of_topologies, 2.0);
        assert!(stats.entropy >= 0.0);
        assert!(!stats.top_clades.is_empty());
        assert!(stats.top_clades.len() <= 10);
        // Best clade is the {A,B} cherry at probability 2/3
        assert_eq!(stats.top_clades[0].taxa, vec!["A", "B"]);
        assert!(approx_eq!(
            f64,
            stats.top_clades[0].probability,
            2.0 / 3.0,
            epsilon = 1e-12
        ));
    }

    #[test]
    fn statistics_progress_variant_matches_plain() {
        let trees = trees_of("((A,B),C);((A,B),C);((A,C),B);");
        let mut plain_ccd = build_ccd_from_trees(&trees, 0.0).unwrap();
        let plain = ccd_statistics(&mut plain_ccd);

        let mut hooked_ccd = build_ccd_from_trees(&trees, 0.0).unwrap();
        let mut calls = 0usize;
        let hooked = ccd_statistics_with_progress(&mut hooked_ccd, &mut |done, total| {
            assert!(done <= total);
            calls += 1;
            true
        })
        .unwrap();
        assert!(calls >= 1);
        assert_eq!(plain.entropy, hooked.entropy);
        assert_eq!(plain.entropy_lewis, hooked.entropy_lewis);
        assert_eq!(plain.max_tree_probability, hooked.max_tree_probability);

        let mut cancelled_ccd = build_ccd_from_trees(&trees, 0.0).unwrap();
        let err =
            ccd_statistics_with_progress(&mut cancelled_ccd, &mut |_, _| false).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}

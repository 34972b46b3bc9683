//! Within-chain dissonance, a mixing diagnostic for posterior tree
//! samples.
//!
//! The tree list is split into k chains. Chain CCDs and one pooled CCD
//! are grown in lockstep, one tree per chain per step; after every step
//! each CCD is re-normalised and its entropy recorded. Dissonance at step
//! i is H_pool − mean(H_j): zero when the chains agree on the topology
//! distribution, positive when they disagree.

use crate::ccd::{Ccd, TaxonIndex};
use crate::error::{Error, Result};
use crate::tree::Tree;
use serde::Serialize;

/// Upper bound on trees sampled per chain for the probability comparison.
pub const MAX_COMPARISON_SAMPLES: usize = 1000;

/// The two-chain probability comparison only makes sense on samples with
/// substantial topology spread.
const COMPARISON_ENTROPY_THRESHOLD: f64 = 10.0;

/// Extremes and average of the dissonance series.
#[derive(Debug, Clone, Serialize)]
pub struct DissonanceSummary {
    #[serde(rename = "final")]
    pub last: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Head-to-head log-probability comparison of two chain CCDs.
#[derive(Debug, Clone, Serialize)]
pub struct ProbabilityComparison {
    /// Trees sampled from each half.
    pub samples_per_chain: usize,
    /// Sampled trees the first chain assigns higher probability.
    pub first_higher: usize,
    /// Sampled trees the second chain assigns higher probability.
    pub second_higher: usize,
    /// Sampled trees with probability 0 under exactly one chain.
    pub in_one_only: usize,
    /// RMS of log p₁ − log p₂ where both are finite.
    pub rms_log_difference: f64,
    /// RMS of |p₁ − p₂| / ((p₁ + p₂)/2) over the pairs whose
    /// probabilities are still representable after `exp()`.
    pub rms_relative_difference: f64,
}

/// Full output of a dissonance run.
#[derive(Debug, Clone, Serialize)]
pub struct DissonanceResult {
    /// Per-chain entropy after each step (k × m).
    pub chain_entropies: Vec<Vec<f64>>,
    /// Pooled entropy after each step (m).
    pub pooled_entropies: Vec<f64>,
    /// Dissonance after each step (m).
    pub dissonance: Vec<f64>,
    pub summary: DissonanceSummary,
    /// Final dissonance over average final chain entropy (0 when the
    /// denominator is 0).
    pub relative_dissonance: f64,
    pub interpretation: String,
    pub probability_comparison: Option<ProbabilityComparison>,
}

/// Dissonance across k tree sets grown in lockstep.
///
/// The nominal length m is the shortest set's length; trailing trees of
/// longer sets are not consumed. `progress(step, m)` runs once per step
/// and may cancel by returning `false`.
pub fn dissonance(
    tree_sets: &[&[Tree]],
    mut progress: Option<&mut dyn FnMut(usize, usize) -> bool>,
) -> Result<DissonanceResult> {
    let k = tree_sets.len();
    if k < 2 {
        return Err(Error::InsufficientTrees {
            operation: "dissonance (tree sets)",
            needed: 2,
            got: k,
        });
    }
    let m = tree_sets.iter().map(|set| set.len()).min().unwrap_or(0);
    if m == 0 {
        return Err(Error::InsufficientTrees {
            operation: "dissonance (trees per set)",
            needed: 1,
            got: 0,
        });
    }

    // One taxon index shared by every CCD so bit positions agree
    let taxa = TaxonIndex::from_labels(
        tree_sets
            .iter()
            .flat_map(|set| set.iter())
            .flat_map(|tree| tree.tip_labels()),
    );
    let mut chains: Vec<Ccd> = (0..k).map(|_| Ccd::new(taxa.clone())).collect();
    let mut pooled = Ccd::new(taxa);

    let mut chain_entropies: Vec<Vec<f64>> = vec![Vec::with_capacity(m); k];
    let mut pooled_entropies: Vec<f64> = Vec::with_capacity(m);
    let mut series: Vec<f64> = Vec::with_capacity(m);

    for step in 0..m {
        if let Some(cb) = progress.as_mut() {
            if !cb(step, m) {
                return Err(Error::Cancelled);
            }
        }

        for (chain, set) in chains.iter_mut().zip(tree_sets) {
            chain.add_tree(&set[step])?;
            pooled.add_tree(&set[step])?;
        }

        let mut chain_sum = 0.0;
        for (chain, record) in chains.iter_mut().zip(chain_entropies.iter_mut()) {
            chain.initialize();
            let h = chain.entropy();
            record.push(h);
            chain_sum += h;
        }
        pooled.initialize();
        let pooled_h = pooled.entropy();
        log::debug!(
            "dissonance step {step}: pooled entropy {pooled_h:.6}, mean chain entropy {:.6}",
            chain_sum / k as f64
        );
        pooled_entropies.push(pooled_h);
        series.push(pooled_h - chain_sum / k as f64);
    }

    let last = *series.last().unwrap_or(&0.0);
    let summary = DissonanceSummary {
        last,
        mean: series.iter().sum::<f64>() / series.len() as f64,
        min: series.iter().copied().fold(f64::INFINITY, f64::min),
        max: series.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };

    let avg_final_chain_entropy = chain_entropies
        .iter()
        .filter_map(|record| record.last())
        .sum::<f64>()
        / k as f64;
    let relative_dissonance = if avg_final_chain_entropy == 0.0 {
        0.0
    } else {
        last / avg_final_chain_entropy
    };

    let probability_comparison = if k == 2 && avg_final_chain_entropy > COMPARISON_ENTROPY_THRESHOLD
    {
        Some(compare_chain_probabilities(
            &mut chains,
            tree_sets[0],
            tree_sets[1],
            m,
        )?)
    } else {
        None
    };

    Ok(DissonanceResult {
        chain_entropies,
        pooled_entropies,
        dissonance: series,
        summary,
        relative_dissonance,
        interpretation: interpret(relative_dissonance).to_string(),
        probability_comparison,
    })
}

/// Dissonance of one tree list split into `num_splits` contiguous blocks.
///
/// The last block absorbs the remainder; a list shorter than two trees
/// per block is rejected.
pub fn within_chain_dissonance(
    trees: &[Tree],
    num_splits: usize,
    progress: Option<&mut dyn FnMut(usize, usize) -> bool>,
) -> Result<DissonanceResult> {
    let k = num_splits.max(2);
    if trees.len() < 2 * k {
        return Err(Error::InsufficientTrees {
            operation: "within-chain dissonance",
            needed: 2 * k,
            got: trees.len(),
        });
    }

    let block = trees.len() / k;
    let sets: Vec<&[Tree]> = (0..k)
        .map(|j| {
            let start = j * block;
            let end = if j == k - 1 { trees.len() } else { start + block };
            &trees[start..end]
        })
        .collect();
    dissonance(&sets, progress)
}

fn compare_chain_probabilities(
    chains: &mut [Ccd],
    first: &[Tree],
    second: &[Tree],
    m: usize,
) -> Result<ProbabilityComparison> {
    let stride = m.div_ceil(MAX_COMPARISON_SAMPLES).max(1);
    let sample: Vec<&Tree> = first
        .iter()
        .take(m)
        .step_by(stride)
        .chain(second.iter().take(m).step_by(stride))
        .collect();
    let samples_per_chain = m.div_ceil(stride);

    let mut first_higher = 0usize;
    let mut second_higher = 0usize;
    let mut in_one_only = 0usize;
    let mut log_sq = 0.0;
    let mut finite = 0usize;
    let mut rel_sq = 0.0;
    let mut rel_terms = 0usize;

    for tree in sample {
        let (head, tail) = chains.split_at_mut(1);
        let lp1 = head[0].tree_log_probability(tree)?;
        let lp2 = tail[0].tree_log_probability(tree)?;
        match (lp1.is_finite(), lp2.is_finite()) {
            (true, true) => {
                if lp1 > lp2 {
                    first_higher += 1;
                } else if lp2 > lp1 {
                    second_higher += 1;
                }
                finite += 1;
                let diff = lp1 - lp2;
                log_sq += diff * diff;
                // exp() can underflow a finite log-probability to 0; a
                // pair with no surviving mass has no relative difference
                // and contributes to neither the sum nor its denominator
                let (p1, p2) = (lp1.exp(), lp2.exp());
                if p1 + p2 > 0.0 {
                    let rel = (p1 - p2).abs() / ((p1 + p2) / 2.0);
                    rel_sq += rel * rel;
                    rel_terms += 1;
                }
            }
            (true, false) => {
                first_higher += 1;
                in_one_only += 1;
            }
            (false, true) => {
                second_higher += 1;
                in_one_only += 1;
            }
            (false, false) => {}
        }
    }

    let rms = |sum_sq: f64, count: usize| {
        if count == 0 {
            0.0
        } else {
            (sum_sq / count as f64).sqrt()
        }
    };
    Ok(ProbabilityComparison {
        samples_per_chain,
        first_higher,
        second_higher,
        in_one_only,
        rms_log_difference: rms(log_sq, finite),
        rms_relative_difference: rms(rel_sq, rel_terms),
    })
}

/// Bucket the relative dissonance into a verbal verdict.
fn interpret(relative: f64) -> &'static str {
    if relative < 0.001 {
        "Exceptional mixing"
    } else if relative < 0.01 {
        "Excellent mixing"
    } else if relative < 0.02 {
        "Very good mixing"
    } else if relative < 0.05 {
        "Good mixing"
    } else if relative < 0.10 {
        "Moderate mixing"
    } else if relative < 0.20 {
        "Poor mixing"
    } else {
        "Very poor mixing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{Format, read_trees};

    fn trees_of(newick: &str) -> Vec<Tree> {
        read_trees(newick, Format::Newick).unwrap()
    }

    #[test]
    fn identical_trees_have_zero_dissonance() {
        let trees: Vec<Tree> = (0..10).flat_map(|_| trees_of("((A,B),C);")).collect();
        let result = within_chain_dissonance(&trees, 2, None).unwrap();
        assert!(result.summary.last.abs() <= 1e-12);
        assert_eq!(result.interpretation, "Exceptional mixing");
        assert_eq!(result.chain_entropies.len(), 2);
        assert_eq!(result.chain_entropies[0].len(), 5);
        assert_eq!(result.pooled_entropies.len(), 5);
        assert_eq!(result.dissonance.len(), 5);
    }

    #[test]
    fn dissonance_is_nonnegative() {
        let trees = trees_of(
            "((A,B),C);((A,B),C);((A,C),B);((B,C),A);\
             ((A,C),B);((A,B),C);((B,C),A);((A,B),C);",
        );
        let result = within_chain_dissonance(&trees, 2, None).unwrap();
        for &d in &result.dissonance {
            assert!(d >= -1e-12, "dissonance {d} negative");
        }
        assert!(result.summary.min >= -1e-12);
    }

    #[test]
    fn disagreeing_halves_have_positive_dissonance() {
        // First half all one topology, second half another
        let trees = trees_of("((A,B),C);((A,B),C);((A,C),B);((A,C),B);");
        let result = within_chain_dissonance(&trees, 2, None).unwrap();
        // Chains are internally pure (entropy 0), the pool is mixed
        assert!(result.summary.last > 0.5);
        assert_eq!(result.relative_dissonance, 0.0);
    }

    #[test]
    fn last_block_absorbs_remainder() {
        let trees: Vec<Tree> = (0..5).flat_map(|_| trees_of("((A,B),C);")).collect();
        let result = within_chain_dissonance(&trees, 2, None).unwrap();
        // Blocks of 2 and 3; lockstep runs to the shorter length
        assert_eq!(result.chain_entropies[0].len(), 2);
    }

    #[test]
    fn too_few_trees_is_rejected() {
        let trees = trees_of("((A,B),C);((A,B),C);((A,C),B);");
        let err = within_chain_dissonance(&trees, 2, None).unwrap_err();
        assert!(matches!(err, Error::InsufficientTrees { .. }));
    }

    #[test]
    fn fewer_than_two_sets_is_rejected() {
        let trees = trees_of("((A,B),C);((A,B),C);");
        let err = dissonance(&[&trees[..]], None).unwrap_err();
        assert!(matches!(err, Error::InsufficientTrees { .. }));
    }

    #[test]
    fn progress_callback_runs_and_cancels() {
        let trees: Vec<Tree> = (0..8).flat_map(|_| trees_of("((A,B),C);")).collect();
        let mut steps = 0usize;
        let result =
            within_chain_dissonance(&trees, 2, Some(&mut |step, total| {
                assert_eq!(total, 4);
                steps = step + 1;
                true
            }))
            .unwrap();
        assert_eq!(steps, 4);
        assert_eq!(result.dissonance.len(), 4);

        let err = within_chain_dissonance(&trees, 2, Some(&mut |_, _| false)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn interpretation_buckets() {
        assert_eq!(interpret(0.0005), "Exceptional mixing");
        assert_eq!(interpret(0.005), "Excellent mixing");
        assert_eq!(interpret(0.015), "Very good mixing");
        assert_eq!(interpret(0.03), "Good mixing");
        assert_eq!(interpret(0.07), "Moderate mixing");
        assert_eq!(interpret(0.15), "Poor mixing");
        assert_eq!(interpret(0.5), "Very poor mixing");
    }
}

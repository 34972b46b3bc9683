//! Crate root: lightweight module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: compact bitset representation for clades and splits.
//! - `tree`: arena-based rooted tree model.
//! - `reader`: tree file reading (Newick/NEXUS) and TSV writers.
//! - `distances`: RF / SPR / path distance kernels and matrix fill.
//! - `mds`: classical multidimensional scaling into two dimensions.
//! - `clade`: vertices and hyperedges of the conditional clade DAG.
//! - `ccd`: conditional clade distribution and derived statistics.
//! - `dissonance`: split-vs-pooled entropy mixing diagnostic.
//! - `driver`: high-level pipelines tying the pieces together.
//! - `error`: shared error type.
//!
//! Public API kept stable by re-exporting key items from the modules.

pub mod bitset;
pub mod ccd;
pub mod clade;
pub mod dissonance;
pub mod distances;
pub mod driver;
pub mod error;
pub mod mds;
pub mod reader;
pub mod tree;

// Re-export frequently used types & functions
pub use bitset::Bitset;
pub use ccd::{Ccd, TaxonIndex};
pub use dissonance::{DissonanceResult, within_chain_dissonance};
pub use distances::{Metric, distance_matrix};
pub use driver::{build_ccd_from_trees, ccd_statistics, mds_pipeline};
pub use error::{Error, Result};
pub use mds::classical_mds;
pub use reader::{Format, read_trees, read_trees_file};
pub use tree::Tree;

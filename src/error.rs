//! Error type shared by the reader, distance, MDS, and CCD layers.

/// Failures surfaced by the analysis engine.
///
/// Every variant carries enough context to name the offending object
/// (taxon label, tree index, format tag) in its message. Errors propagate
/// to the caller unchanged; nothing in this crate retries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Too few trees for the requested analysis.
    #[error("insufficient trees: {needed} required for {operation}, got {got}")]
    InsufficientTrees {
        operation: &'static str,
        needed: usize,
        got: usize,
    },

    /// A tree violates the rooted-binary contract.
    #[error("malformed tree: {reason}")]
    MalformedTree { reason: String },

    /// A leaf label is absent from a frozen taxon index.
    #[error("unknown taxon '{label}' (taxon index is frozen with {known} taxa)")]
    TaxonUnknown { label: String, known: usize },

    /// Input bytes matched no recognisable tree format.
    #[error("unrecognised tree format: {detail}")]
    FormatUnknown { detail: String },

    /// The underlying parser rejected the input.
    #[error("parse failure: {message}")]
    ParseFailure { message: String },

    /// A numerical routine failed (non-symmetric input, non-convergence).
    #[error("numeric failure: {reason}")]
    NumericFailure { reason: String },

    /// A progress callback requested cancellation.
    #[error("operation cancelled by progress callback")]
    Cancelled,

    /// File input/output problems from the CLI paths.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Report serialization problems from the CLI paths.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedTree {
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Error::ParseFailure {
            message: message.into(),
        }
    }

    pub(crate) fn numeric(reason: impl Into<String>) -> Self {
        Error::NumericFailure {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

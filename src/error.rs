//! Common errors across the mars2cf crate

use crate::catalog::{AccumulationMethod, LevelType};

/// Standard error type for all conversion steps.
///
/// There is no local recovery anywhere in the core: any of these conditions
/// aborts the current file's conversion immediately and surfaces to the
/// caller. Partially written output files are left on disk for the caller
/// to inspect or remove.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// The requested variable is not registered in the catalog, at least
    /// not for the requested time kind.
    #[error("variable '{0}' is not registered in the variable catalog")]
    UnknownVariable(String),
    /// The caller's selection of catalog, variable, and time kind does not
    /// identify exactly one variable spec, or a catalog file is malformed.
    #[error("invalid conversion setup: {0}")]
    Configuration(String),
    /// The source time coordinate is not uniformly sampled. Only fixed-step
    /// time axes are supported.
    #[error("source time axis is not uniformly spaced: {0}")]
    IrregularTimeAxis(String),
    /// The catalog declares this de-accumulation method, but only "mean" is
    /// implemented.
    #[error("de-accumulation with method '{0}' is not implemented")]
    UnsupportedAccumulation(AccumulationMethod),
    /// Only surface fields (optionally with a fixed scalar height) can be
    /// written; a true vertical axis is not implemented.
    #[error("fields on '{0}' levels are not implemented")]
    UnsupportedLevelType(LevelType),
    /// Catch-all for paths that are recognized but deliberately not built.
    #[error("{0} is not supported")]
    UnsupportedFeature(String),
    /// A dimension, variable, or attribute the conversion needs is absent
    /// from the source file.
    #[error("source file does not contain {0}")]
    MissingSourceField(String),
    #[error("an error occurred while reading the source file: {0}")]
    ReadingSource(String),
    #[error("an error occurred while writing the output file: {0}")]
    WritingOutput(String),
    #[error("MARS retrieval failed: {0}")]
    Retrieval(String),
    #[error("could not delete intermediate file {}", .0.display())]
    Cleanup(std::path::PathBuf),
}

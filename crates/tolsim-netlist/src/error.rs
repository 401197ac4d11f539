//! Error types for netlist parsing and perturbation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for netlist operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or perturbing a circuit description.
#[derive(Debug, Error)]
pub enum Error {
    /// The description file could not be read.
    #[error("failed to read circuit description {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Tolerance outside `[0, 1)` or not finite.
    #[error("tolerance must be a finite fraction in [0, 1), got {0}")]
    InvalidTolerance(f64),

    /// Too many decimal digits requested for rendered values.
    #[error("value precision must be at most {max} digits, got {got}")]
    InvalidPrecision { got: usize, max: usize },
}

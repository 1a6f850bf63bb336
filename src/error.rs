//! Crate-wide error type.
//!
//! Shape mismatches are programmer errors and panic (debug assertions), so
//! this enum only covers what a caller can reasonably recover from: missing
//! or truncated parameter files, bad configuration and accelerator failures.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by `briny_nn`.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading or writing a parameter file failed.
    #[error("failed to access parameter file '{}'", path.display())]
    Io {
        /// File that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A parameter file holds fewer values than the layer expects.
    #[error("parameter file '{}' holds {found} values, expected {expected}", path.display())]
    ParamLength {
        /// File that was read.
        path: PathBuf,
        /// Values required by the layer shape.
        expected: usize,
        /// Values present in the file.
        found: usize,
    },
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Accelerator bring-up, kernel build or launch failure.
    #[error("device error: {0}")]
    Device(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Raw parameter dumps.
//!
//! A layer persists its parameters as the concatenation of every weight
//! matrix followed by every bias matrix, each in row-major element order.
//! There is no header and no shape metadata:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────┬─────┐
//! │ W[0] data    │ W[1] data    │ …   │ b[0] data    │ …   │
//! │ [T; r0·c0]   │ [T; r1·c1]   │     │ [T; …]       │     │
//! └──────────────┴──────────────┴─────┴──────────────┴─────┘
//! ```
//!
//! Elements are little-endian `f32` or `f64` depending on the layer's
//! element type. The shapes are rebuilt from the layer's construction
//! arguments, so a dump can only be loaded into an identically configured
//! layer. A file that is too short is reported as
//! [`Error::ParamLength`] rather than read past its end.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use briny::prelude::*;

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::real::Real;

/// Raw bytes read back from disk, checked against the expected shapes.
struct ParamBlock {
    bytes: Vec<u8>,
    expected: usize,
}

impl Validate for ParamBlock {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.bytes.len() < self.expected {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io { path: path.to_path_buf(), source }
}

/// Writes `params` back to back, in order.
///
/// # Errors
/// [`Error::Io`] if the file cannot be created or written.
pub fn write_params<T: Real>(path: &Path, params: &[&Matrix<T>]) -> Result<()> {
    let total: usize = params.iter().map(|m| m.as_slice().len()).sum();
    let mut bytes = Vec::with_capacity(total * T::BYTES);
    for m in params {
        for &x in m.as_slice() {
            x.write_le(&mut bytes);
        }
    }

    let mut file = BufWriter::new(File::create(path).map_err(io_error(path))?);
    file.write_all(&bytes).map_err(io_error(path))?;
    file.flush().map_err(io_error(path))?;

    tracing::debug!(path = %path.display(), values = total, "wrote parameters");
    Ok(())
}

/// Reads matrices of the given `(rows, cols)` shapes back from `path`.
///
/// Trailing bytes beyond the expected values are ignored.
///
/// # Errors
/// - [`Error::Io`] if the file cannot be opened or read.
/// - [`Error::ParamLength`] if it holds fewer values than the shapes need.
pub fn read_params<T: Real>(path: &Path, shapes: &[(usize, usize)]) -> Result<Vec<Matrix<T>>> {
    let expected: usize = shapes.iter().map(|&(r, c)| r * c).sum();

    let mut bytes = Vec::new();
    BufReader::new(File::open(path).map_err(io_error(path))?)
        .read_to_end(&mut bytes)
        .map_err(io_error(path))?;

    let found = bytes.len() / T::BYTES;
    let block = TrustedData::new(ParamBlock { bytes, expected: expected * T::BYTES }).map_err(|_| {
        Error::ParamLength { path: path.to_path_buf(), expected, found }
    })?;
    let bytes = block.into_inner().bytes;

    let mut values = bytes.chunks_exact(T::BYTES).map(T::read_le);
    let out = shapes
        .iter()
        .map(|&(r, c)| Matrix::from_vec(r, c, values.by_ref().take(r * c).collect()))
        .collect();

    tracing::debug!(path = %path.display(), values = expected, "read parameters");
    Ok(out)
}

//! Backend selection.
//!
//! Two independent process-wide choices are kept here:
//!
//! - [`Backend`] — where layer kernels run (`Cpu` or `Wgpu`).
//! - [`GemmBackend`] — which strategy performs dense matrix products
//!   (`Naive`, `Blas` or `Expr`).
//!
//! Both are stored in atomics so they can be read from any thread without
//! locking. They are meant to be set once at startup, usually through
//! [`EngineConfig::install`](crate::config::EngineConfig::install), and then
//! left alone; every call site goes through the same dispatch so switching
//! never requires touching layer code.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Device used for layer kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Backend {
    /// rayon-parallel CPU kernels (default).
    #[default]
    Cpu = 0,
    /// WGSL compute kernels through `wgpu`; falls back to CPU when the
    /// feature is disabled or no device is available.
    Wgpu,
}

impl Backend {
    /// Whether this backend is compiled into the current build.
    pub fn is_available(self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
        }
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(format!("unknown device backend '{other}'")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        })
    }
}

/// Strategy behind every matrix product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum GemmBackend {
    /// Parallel triple loop; always available.
    #[default]
    Naive = 0,
    /// `matrixmultiply` sgemm/dgemm (feature `blas`).
    Blas,
    /// `ndarray` general_mat_mul (feature `ndarray`).
    Expr,
}

impl GemmBackend {
    /// Whether this strategy is compiled into the current build.
    pub fn is_available(self) -> bool {
        match self {
            Self::Naive => true,
            Self::Blas => cfg!(feature = "blas"),
            Self::Expr => cfg!(feature = "ndarray"),
        }
    }
}

impl TryFrom<u8> for GemmBackend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Naive),
            1 => Ok(Self::Blas),
            2 => Ok(Self::Expr),
            _ => Err(()),
        }
    }
}

impl FromStr for GemmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "naive" => Ok(Self::Naive),
            "blas" => Ok(Self::Blas),
            "expr" | "ndarray" => Ok(Self::Expr),
            other => Err(format!("unknown gemm backend '{other}'")),
        }
    }
}

impl fmt::Display for GemmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Naive => "naive",
            Self::Blas => "blas",
            Self::Expr => "expr",
        })
    }
}

static GLOBAL_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);
static GLOBAL_GEMM: AtomicU8 = AtomicU8::new(GemmBackend::Naive as u8);

/// Sets the device used for layer kernels.
///
/// # Example
///
/// ```
/// use briny_nn::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the active device backend, defaulting to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

/// Sets the strategy used by every matrix product.
pub fn set_gemm_backend(b: GemmBackend) {
    GLOBAL_GEMM.store(b as u8, Ordering::Release);
}

/// Returns the active matrix product strategy, defaulting to
/// [`GemmBackend::Naive`].
pub fn get_gemm_backend() -> GemmBackend {
    GemmBackend::try_from(GLOBAL_GEMM.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names() {
        assert_eq!("CPU".parse::<Backend>(), Ok(Backend::Cpu));
        assert_eq!("gpu".parse::<Backend>(), Ok(Backend::Wgpu));
        assert_eq!("ndarray".parse::<GemmBackend>(), Ok(GemmBackend::Expr));
        assert!("cuda".parse::<Backend>().is_err());
    }

    #[test]
    fn naive_is_always_available() {
        assert!(GemmBackend::Naive.is_available());
        assert!(Backend::Cpu.is_available());
    }
}

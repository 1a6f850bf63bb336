//! Kernel dispatch.
//!
//! Selects the backend for each batch-normalization kernel at runtime from
//! the global [`Backend`](crate::backend::Backend):
//!
//! 1. `Wgpu` (if the feature is enabled and the device came up)
//! 2. Falls back to `Cpu`
//!
//! A GPU kernel that fails logs a warning and the call is served by the CPU
//! kernel, so results never depend on whether a device is present.

use super::BnGeometry;
use crate::backend::{Backend, get_backend};
use crate::matrix::Matrix;
use crate::real::Real;

/// Batch mean and biased variance for the local slice.
pub fn bn_mean_var<T: Real>(u: &Matrix<T>, g: &BnGeometry) -> (Matrix<T>, Matrix<T>) {
    if get_backend() == Backend::Wgpu {
        #[cfg(feature = "wgpu")]
        {
            if let Some(result) = super::wgpu::wgpu_bn_mean_var(u, g) {
                return result;
            }
        }
    }

    super::cpu::bn_mean_var(u, g)
}

/// Normalized output for the local slice.
pub fn bn_apply<T: Real>(
    u: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    b: &Matrix<T>,
    g: &BnGeometry,
) -> Matrix<T> {
    if get_backend() == Backend::Wgpu {
        #[cfg(feature = "wgpu")]
        {
            if let Some(result) = super::wgpu::wgpu_bn_apply(u, mean, var, w, b, g) {
                return result;
            }
        }
    }

    super::cpu::bn_apply(u, mean, var, w, b, g)
}

/// Input delta for the local slice.
#[allow(clippy::too_many_arguments)]
pub fn bn_delta<T: Real>(
    u_appl: &Matrix<T>,
    u_diff: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    g: &BnGeometry,
) -> Matrix<T> {
    if get_backend() == Backend::Wgpu {
        #[cfg(feature = "wgpu")]
        {
            if let Some(result) = super::wgpu::wgpu_bn_delta(u_appl, u_diff, delta, mean, var, w, g) {
                return result;
            }
        }
    }

    super::cpu::bn_delta(u_appl, u_diff, delta, mean, var, w, g)
}

/// Per-map partial scale and shift gradients for the local slice.
pub fn bn_grad<T: Real>(
    u_appl: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    g: &BnGeometry,
) -> (Vec<T>, Vec<T>) {
    if get_backend() == Backend::Wgpu {
        #[cfg(feature = "wgpu")]
        {
            if let Some(result) = super::wgpu::wgpu_bn_grad(u_appl, delta, mean, var, g) {
                return result;
            }
        }
    }

    super::cpu::bn_grad(u_appl, delta, mean, var, g)
}

//! # Batch-normalization kernels
//!
//! The numeric core of [`BatchNormalize`](crate::layer::BatchNormalize) is
//! split into four kernels that every backend implements identically:
//!
//! | kernel        | output                                               |
//! |---------------|------------------------------------------------------|
//! | `bn_mean_var` | per map/unit batch mean and biased variance          |
//! | `bn_apply`    | `W·(x − mean)/√(var + ε) + b` for the local slice    |
//! | `bn_delta`    | three-term backward pass for the local slice         |
//! | `bn_grad`     | per-map partial sums of `δ·x̂` and `δ`                |
//!
//! All kernels work on the unit slice described by a [`BnGeometry`]; the
//! layer takes care of combining slices across workers.
//!
//! ## Submodules
//!
//! - [`cpu`] — rayon kernels (default)
//! - [`wgpu`] *(opt-in)* — WGSL compute kernels and the device shim that
//!   binds their arguments and launches them
//! - [`dispatch`] — picks a backend per call and falls back to CPU
//!
//! ## Feature Flags
//!
//! - `wgpu` — enables the GPU kernels

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Brings up the accelerator, or reports why it cannot run.
///
/// # Errors
/// [`Error::Device`](crate::Error::Device) if the build lacks the `wgpu`
/// feature or no usable device was found.
pub fn accelerator_ready() -> crate::Result<()> {
    #[cfg(feature = "wgpu")]
    {
        self::wgpu::device_manager()?;
        Ok(())
    }
    #[cfg(not(feature = "wgpu"))]
    {
        Err(crate::Error::Device("built without the `wgpu` feature".to_owned()))
    }
}

/// Where a batch-normalization kernel reads and writes.
///
/// The input `U` and delta are full stacked activations
/// (`num_map · num_unit` rows, `batch` columns); kernels only touch the rows
/// of units `offset .. offset + size` of every map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BnGeometry {
    /// Number of channels.
    pub num_map: usize,
    /// Units per channel.
    pub num_unit: usize,
    /// First unit owned by this worker.
    pub offset: usize,
    /// Units owned by this worker.
    pub size: usize,
    /// Samples in the batch.
    pub batch: usize,
    /// Variance guard.
    pub eps: f64,
}

//! briny_nn: a data-parallel neural network compute engine in Rust.
//!
//! Dense matrices, activation and loss functions, and layers that split
//! their work across cooperating workers, with optional GPU kernels for
//! batch normalization.
//!
//! # Features
//!
//! - Row-major [`matrix::Matrix`] with a fused `alpha·A·B + beta·C` product,
//!   zero-copy transposed operands and three interchangeable GEMM
//!   strategies (`naive`, `blas`, `expr`).
//! - A fixed layer set: fully connected, convolution, pooling and batch
//!   normalization, all following the same [`layer::Layer`] contract.
//! - Worker partitioning: every layer owns a slice of its output units and
//!   recombines results with blocking collectives ([`comm`]).
//! - Raw little-endian parameter files ([`modelio`]).
//! - An injected FLOP counter ([`flops`]) instead of global state.
//!
//! # Modules
//!
//! - [`matrix`] — storage, products, transpose views, LU.
//! - [`function`] — activations and losses.
//! - [`layer`] — the layer contract and implementations.
//! - [`ops`] — batch-normalization kernels and their CPU/GPU dispatch.
//! - [`partition`] / [`comm`] — work splitting and collectives.
//! - [`network`] — a sequential training driver.
//! - [`config`] / [`logging`] — process-wide setup.
//!
//! # Feature Flags
//!
//! - `blas` — `matrixmultiply` GEMM
//! - `ndarray` — `ndarray` GEMM
//! - `wgpu` — GPU batch-normalization kernels
//!
//! # Example
//!
//! ```rust
//! use briny_nn::matrix::Matrix;
//!
//! let a = Matrix::from_vec(2, 2, vec![1.0f64, 2.0, 3.0, 4.0]);
//! let c = a.t() * &a;
//! assert_eq!(c.as_slice(), &[10.0, 14.0, 14.0, 20.0]);
//! ```

pub mod backend;
pub mod comm;
pub mod config;
pub mod error;
pub mod flops;
pub mod function;
pub mod layer;
pub mod logging;
pub mod matrix;
pub mod modelio;
pub mod network;
pub mod ops;
pub mod partition;
pub mod real;

pub use error::{Error, Result};
pub use real::Real;

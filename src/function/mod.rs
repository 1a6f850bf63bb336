//! Activation and loss functions.
//!
//! Functions are stateless objects shared between layers through
//! [`SharedFunction`] / [`SharedLoss`]. An activation has two modes: its
//! value (`diff = false`) and its elementwise derivative (`diff = true`).
//! Layers call the derivative of the *previous* layer's activation during
//! `calc_delta`, which is why every layer keeps a handle to it.

mod activation;
mod loss;

use std::fmt::Debug;
use std::sync::Arc;

use crate::matrix::Matrix;
use crate::real::Real;

pub use activation::{
    Abs, Identity, LeakyReLU, Polynomial, ReLU, Sigmoid, Softmax, Softplus, Softsign, Tanh,
    TruncatedPower,
};
pub use loss::{CrossEntropy, Square};

/// An activation usable by any layer.
pub trait Function<T: Real>: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Value of the function, or its derivative when `diff` is set.
    fn apply(&self, x: &Matrix<T>, diff: bool) -> Matrix<T>;
}

/// A loss comparing a network output `y` with targets `d`.
///
/// Both matrices are stacked activations (one column per sample).
pub trait LossFunction<T: Real>: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Loss summed over the batch.
    fn loss(&self, y: &Matrix<T>, d: &Matrix<T>) -> T;

    /// Derivative of the loss with respect to `y`.
    fn gradient(&self, y: &Matrix<T>, d: &Matrix<T>) -> Matrix<T>;
}

/// Shared activation handle.
pub type SharedFunction<T> = Arc<dyn Function<T>>;

/// Shared loss handle.
pub type SharedLoss<T> = Arc<dyn LossFunction<T>>;

/// The identity, as a shared handle.
pub fn identity<T: Real>() -> SharedFunction<T> {
    Arc::new(Identity)
}

//! # Layers
//!
//! Every layer maps a stacked activation `U` (`prev_num_map · prev_num_unit`
//! rows, one column per sample) to a stacked output
//! (`num_map · num_unit` rows). The contract is the same for every kind:
//!
//! | method           | does                                                |
//! |------------------|-----------------------------------------------------|
//! | `init`           | draws parameters from a seed shared by the group    |
//! | `apply`          | forward pass, optionally through the activation     |
//! | `calc_delta`     | back-propagates δ to the previous layer             |
//! | `calc_gradient`  | unscaled `(dW, db)`, same shapes as `(W, b)`        |
//! | `update_w`       | `W += dW`, `b += db` (caller pre-scales)            |
//! | `set_w`/`output_w` | raw parameter dump, see [`modelio`](crate::modelio) |
//! | `param_mix`      | averages parameters over the outer group            |
//!
//! `calc_delta` receives the previous layer's *pre-activation* output and
//! already folds in the derivative of the previous activation, which is why
//! each layer keeps `prev_func` next to its own `func`.
//!
//! Work is split across the inner group of the [`WorkerContext`]: each
//! worker computes a [`partition`](crate::partition) slice of the output
//! units and the slices are recombined with collectives, so every worker
//! ends each call holding the full result.
//!
//! The set of layer kinds is closed; [`LayerKind`] wraps them for
//! heterogeneous networks.

mod batch_normalize;
mod convolution;
mod fully_connected;
mod pooling;

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::comm::{WorkerContext, all_reduce_real};
use crate::error::Result;
use crate::function::{SharedFunction, identity};
use crate::matrix::Matrix;
use crate::modelio::{read_params, write_params};
use crate::real::Real;

pub use batch_normalize::{BatchNormalize, EPS};
pub use convolution::{ConvShape, Convolution};
pub use fully_connected::FullyConnected;
pub use pooling::{PoolMode, PoolShape, Pooling};

/// `(dW, db)` as returned by [`Layer::calc_gradient`].
pub type Gradient<T> = (Vec<Matrix<T>>, Vec<Matrix<T>>);

/// Input and output geometry of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerShape {
    /// Channels of the input.
    pub prev_num_map: usize,
    /// Units per input channel.
    pub prev_num_unit: usize,
    /// Channels of the output.
    pub num_map: usize,
    /// Units per output channel.
    pub num_unit: usize,
}

impl LayerShape {
    /// Rows of the stacked input.
    pub fn input_rows(&self) -> usize {
        self.prev_num_map * self.prev_num_unit
    }

    /// Rows of the stacked output.
    pub fn output_rows(&self) -> usize {
        self.num_map * self.num_unit
    }
}

/// State every layer carries.
#[derive(Debug, Clone)]
pub struct LayerCore<T: Real> {
    pub(crate) func: SharedFunction<T>,
    pub(crate) prev_func: SharedFunction<T>,
    pub(crate) ctx: WorkerContext,
    pub(crate) w: Vec<Matrix<T>>,
    pub(crate) b: Vec<Matrix<T>>,
}

impl<T: Real> LayerCore<T> {
    pub(crate) fn new(func: SharedFunction<T>, w: Vec<Matrix<T>>, b: Vec<Matrix<T>>) -> Self {
        Self { func, prev_func: identity(), ctx: WorkerContext::single(), w, b }
    }

    /// `(prev_func(u), prev_func'(u))`.
    pub(crate) fn prev_activation(&self, u: &Matrix<T>) -> (Matrix<T>, Matrix<T>) {
        (self.prev_func.apply(u, false), self.prev_func.apply(u, true))
    }

    /// Runs the own activation when requested.
    pub(crate) fn activate(&self, u: Matrix<T>, use_func: bool) -> Matrix<T> {
        if use_func { self.func.apply(&u, false) } else { u }
    }
}

/// A generator seeded identically on every member of the inner group.
///
/// Draws one seed from `rng`, keeps rank 0's and seeds a fresh generator
/// with it.
pub(crate) fn shared_rng(rng: &mut ChaCha8Rng, ctx: &WorkerContext) -> ChaCha8Rng {
    let seed = ctx.inner.broadcast_u64(rng.random::<u64>(), 0);
    ChaCha8Rng::seed_from_u64(seed)
}

/// `rows × cols` drawn from U(−bound, bound).
pub(crate) fn uniform<T: Real>(rng: &mut ChaCha8Rng, rows: usize, cols: usize, bound: f64) -> Matrix<T> {
    Matrix::from_fn(rows, cols, |_, _| T::from_f64(rng.random_range(-bound..bound)))
}

/// Glorot-uniform bound.
pub(crate) fn glorot(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out).max(1) as f64).sqrt()
}

/// The layer contract.
pub trait Layer<T: Real>: Send + Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Input and output geometry.
    fn shape(&self) -> LayerShape;

    /// Shared state.
    fn core(&self) -> &LayerCore<T>;

    /// Shared state, mutably.
    fn core_mut(&mut self) -> &mut LayerCore<T>;

    /// Stores `ctx` and draws the parameters.
    ///
    /// Collective over the inner group.
    fn init(&mut self, rng: &mut ChaCha8Rng, ctx: &WorkerContext);

    /// Forward pass of `u` (already activated by the previous layer).
    fn apply(&mut self, u: &Matrix<T>, use_func: bool) -> Matrix<T>;

    /// δ for the previous layer from this layer's δ and the previous
    /// pre-activation `u`.
    fn calc_delta(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Matrix<T>;

    /// Unscaled parameter gradients.
    fn calc_gradient(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Gradient<T>;

    /// This layer's activation.
    fn func(&self) -> &SharedFunction<T> {
        &self.core().func
    }

    /// Activation of the previous layer.
    fn prev_func(&self) -> &SharedFunction<T> {
        &self.core().prev_func
    }

    /// Replaces the activation of the previous layer.
    fn set_prev_func(&mut self, f: SharedFunction<T>) {
        self.core_mut().prev_func = f;
    }

    /// Locally held `(W, b)`.
    fn weights(&self) -> (&[Matrix<T>], &[Matrix<T>]) {
        let core = self.core();
        (&core.w, &core.b)
    }

    /// `W += dW`, `b += db`.
    fn update_w(&mut self, dw: &[Matrix<T>], db: &[Matrix<T>]) {
        let core = self.core_mut();
        debug_assert_eq!(dw.len(), core.w.len(), "weight gradient count mismatch");
        debug_assert_eq!(db.len(), core.b.len(), "bias gradient count mismatch");
        core.w.iter_mut().zip(dw).for_each(|(w, d)| *w += d);
        core.b.iter_mut().zip(db).for_each(|(b, d)| *b += d);
    }

    /// Loads parameters written by [`Layer::output_w`].
    ///
    /// # Errors
    /// [`Error::Io`](crate::Error::Io) or
    /// [`Error::ParamLength`](crate::Error::ParamLength).
    fn set_w(&mut self, path: &Path) -> Result<()> {
        let core = self.core_mut();
        let shapes: Vec<_> = core.w.iter().chain(&core.b).map(Matrix::shape).collect();
        let mut loaded = read_params(path, &shapes)?;
        core.b = loaded.split_off(core.w.len());
        core.w = loaded;
        Ok(())
    }

    /// Writes the parameters; only rank 0 of the inner group touches the
    /// file.
    ///
    /// # Errors
    /// [`Error::Io`](crate::Error::Io).
    fn output_w(&self, path: &Path) -> Result<()> {
        let core = self.core();
        if core.ctx.rank() != 0 {
            return Ok(());
        }
        let all: Vec<&Matrix<T>> = core.w.iter().chain(&core.b).collect();
        write_params(path, &all)
    }

    /// Replaces every parameter with its mean over the outer group.
    fn param_mix(&mut self) {
        let core = self.core_mut();
        let outer = Arc::clone(&core.ctx.outer);
        let replicas = outer.size();
        if replicas == 1 {
            return;
        }

        let mut buf: Vec<T> = core.w.iter().chain(&core.b).flat_map(|m| m.as_slice().iter().copied()).collect();
        all_reduce_real(&*outer, &mut buf);

        let n = T::from_f64(replicas as f64);
        core.w
            .iter_mut()
            .chain(core.b.iter_mut())
            .flat_map(|m| m.as_mut_slice().iter_mut())
            .zip(buf)
            .for_each(|(x, sum)| *x = sum / n);
    }
}

/// Any of the built-in layers.
#[derive(Debug, Clone)]
pub enum LayerKind<T: Real> {
    /// Dense layer.
    FullyConnected(FullyConnected<T>),
    /// 2D convolution.
    Convolution(Convolution<T>),
    /// Max or average pooling.
    Pooling(Pooling<T>),
    /// Per-channel batch normalization.
    BatchNormalize(BatchNormalize<T>),
}

macro_rules! each_kind {
    ($self:expr, $l:ident => $body:expr) => {
        match $self {
            LayerKind::FullyConnected($l) => $body,
            LayerKind::Convolution($l) => $body,
            LayerKind::Pooling($l) => $body,
            LayerKind::BatchNormalize($l) => $body,
        }
    };
}

macro_rules! impl_from_kind {
    ($($variant:ident),*) => {
        $(
            impl<T: Real> From<$variant<T>> for LayerKind<T> {
                fn from(layer: $variant<T>) -> Self {
                    Self::$variant(layer)
                }
            }
        )*
    };
}

impl_from_kind!(FullyConnected, Convolution, Pooling, BatchNormalize);

impl<T: Real> Layer<T> for LayerKind<T> {
    fn name(&self) -> &'static str {
        each_kind!(self, l => l.name())
    }

    fn shape(&self) -> LayerShape {
        each_kind!(self, l => l.shape())
    }

    fn core(&self) -> &LayerCore<T> {
        each_kind!(self, l => l.core())
    }

    fn core_mut(&mut self) -> &mut LayerCore<T> {
        each_kind!(self, l => l.core_mut())
    }

    fn init(&mut self, rng: &mut ChaCha8Rng, ctx: &WorkerContext) {
        each_kind!(self, l => l.init(rng, ctx))
    }

    fn apply(&mut self, u: &Matrix<T>, use_func: bool) -> Matrix<T> {
        each_kind!(self, l => l.apply(u, use_func))
    }

    fn calc_delta(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Matrix<T> {
        each_kind!(self, l => l.calc_delta(u, delta))
    }

    fn calc_gradient(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Gradient<T> {
        each_kind!(self, l => l.calc_gradient(u, delta))
    }

    fn update_w(&mut self, dw: &[Matrix<T>], db: &[Matrix<T>]) {
        each_kind!(self, l => l.update_w(dw, db))
    }

    fn set_w(&mut self, path: &Path) -> Result<()> {
        each_kind!(self, l => l.set_w(path))
    }

    fn output_w(&self, path: &Path) -> Result<()> {
        each_kind!(self, l => l.output_w(path))
    }

    fn param_mix(&mut self) {
        each_kind!(self, l => l.param_mix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Sigmoid;

    #[test]
    fn shared_rng_is_deterministic() {
        let ctx = WorkerContext::single();
        let mut a = shared_rng(&mut ChaCha8Rng::seed_from_u64(9), &ctx);
        let mut b = shared_rng(&mut ChaCha8Rng::seed_from_u64(9), &ctx);
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }

    #[test]
    fn glorot_bound() {
        assert!((glorot(4, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn kind_forwards_to_variant() {
        let mut layer: LayerKind<f64> = FullyConnected::new(1, 3, 1, 2, Arc::new(Sigmoid)).into();
        layer.init(&mut ChaCha8Rng::seed_from_u64(1), &WorkerContext::single());
        assert_eq!(layer.name(), "fully_connected");
        assert_eq!(layer.shape().output_rows(), 2);
        let (w, b) = layer.weights();
        assert_eq!(w[0].shape(), (2, 3));
        assert_eq!(b[0].shape(), (2, 1));
    }

    #[test]
    fn update_adds_in_place() {
        let mut layer = BatchNormalize::<f64>::new(2, 1, identity());
        let dw = [Matrix::from_vec(1, 2, vec![0.5, -0.5])];
        let db = [Matrix::from_vec(1, 2, vec![1.0, 2.0])];
        let before = layer.weights().0[0].clone();
        layer.update_w(&dw, &db);
        assert_eq!(layer.weights().0[0], &before + &dw[0]);
        assert_eq!(layer.weights().1[0], db[0]);
    }
}

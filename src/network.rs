//! Sequential network driver.
//!
//! [`Sequential`] chains layers, runs mini-batch gradient descent with L2
//! weight decay and persists every layer to its own raw parameter file.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use briny_nn::comm::WorkerContext;
//! use briny_nn::function::{Sigmoid, Square};
//! use briny_nn::layer::FullyConnected;
//! use briny_nn::matrix::Matrix;
//! use briny_nn::network::Sequential;
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! let mut net = Sequential::<f64>::new(Arc::new(Square));
//! net.push(FullyConnected::new(1, 2, 1, 3, Arc::new(Sigmoid)))
//!     .push(FullyConnected::new(1, 3, 1, 1, Arc::new(Sigmoid)));
//! net.init(&mut ChaCha8Rng::seed_from_u64(7), &WorkerContext::single());
//!
//! let y = net.apply(&Matrix::zeros(2, 5));
//! assert_eq!(y.shape(), (1, 5));
//! ```

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::comm::WorkerContext;
use crate::error::Result;
use crate::function::{SharedLoss, identity};
use crate::layer::{Layer, LayerKind};
use crate::matrix::Matrix;
use crate::real::Real;

/// A stack of layers trained end to end.
#[derive(Debug, Clone)]
pub struct Sequential<T: Real> {
    layers: Vec<LayerKind<T>>,
    loss: SharedLoss<T>,
    learning_rate: T,
    lambda: T,
    batch_size: usize,
}

impl<T: Real> Sequential<T> {
    /// An empty network minimizing `loss`.
    ///
    /// Defaults: learning rate `0.01`, no weight decay, batch size `32`.
    pub fn new(loss: SharedLoss<T>) -> Self {
        Self { layers: Vec::new(), loss, learning_rate: T::from_f64(0.01), lambda: T::zero(), batch_size: 32 }
    }

    /// Appends a layer, wiring its `prev_func` to the current last layer's
    /// activation.
    pub fn push(&mut self, layer: impl Into<LayerKind<T>>) -> &mut Self {
        let mut layer = layer.into();
        let prev = self.layers.last().map_or_else(identity, |l| l.func().clone());
        layer.set_prev_func(prev);
        self.layers.push(layer);
        self
    }

    /// The layers, in order.
    pub fn layers(&self) -> &[LayerKind<T>] {
        &self.layers
    }

    /// The layers, mutably.
    pub fn layers_mut(&mut self) -> &mut [LayerKind<T>] {
        &mut self.layers
    }

    /// Step size.
    pub fn set_learning_rate(&mut self, lr: f64) -> &mut Self {
        self.learning_rate = T::from_f64(lr);
        self
    }

    /// L2 weight decay coefficient.
    pub fn set_lambda(&mut self, lambda: f64) -> &mut Self {
        self.lambda = T::from_f64(lambda);
        self
    }

    /// Columns per mini-batch in [`Sequential::learning`].
    pub fn set_batch_size(&mut self, batch_size: usize) -> &mut Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Initializes every layer from `rng`.
    ///
    /// Collective over the inner group of `ctx`.
    pub fn init(&mut self, rng: &mut ChaCha8Rng, ctx: &WorkerContext) {
        for layer in &mut self.layers {
            layer.init(rng, ctx);
        }
        tracing::info!(layers = self.layers.len(), workers = ctx.inner.size(), "network initialised");
    }

    /// Initializes from a wall-clock seed chosen by rank 0 and returns the
    /// seed.
    pub fn init_from_clock(&mut self, ctx: &WorkerContext) -> u64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or_default();
        let seed = ctx.inner.broadcast_u64(now, 0);
        self.init(&mut ChaCha8Rng::seed_from_u64(seed), ctx);
        seed
    }

    /// Network output for `x`.
    pub fn apply(&mut self, x: &Matrix<T>) -> Matrix<T> {
        self.forward(x).1
    }

    /// Pre-activation outputs of every layer (input first) and the final
    /// activated output.
    fn forward(&mut self, x: &Matrix<T>) -> (Vec<Matrix<T>>, Matrix<T>) {
        let mut us = Vec::with_capacity(self.layers.len() + 1);
        us.push(x.clone());
        let mut z = x.clone();
        for layer in &mut self.layers {
            let u = layer.apply(&z, false);
            z = layer.func().apply(&u, false);
            us.push(u);
        }
        (us, z)
    }

    /// Loss of the network on `(x, d)` without updating anything.
    pub fn loss(&mut self, x: &Matrix<T>, d: &Matrix<T>) -> T {
        let y = self.apply(x);
        self.loss.loss(&y, d)
    }

    /// One gradient step on the batch `(x, d)`; returns the loss before the
    /// step.
    ///
    /// `W += −lr·(dW/batch + λ·W)` and `b += −lr·db/batch`.
    pub fn train_step(&mut self, x: &Matrix<T>, d: &Matrix<T>) -> T {
        let (us, y) = self.forward(x);
        let loss = self.loss.loss(&y, d);
        let Some(last) = self.layers.last() else {
            return loss;
        };

        let n = self.layers.len();
        let mut delta = self.loss.gradient(&y, d).hadamard(&last.func().apply(&us[n], true));
        let mut grads = Vec::with_capacity(n);
        for (idx, layer) in self.layers.iter().enumerate().rev() {
            grads.push(layer.calc_gradient(&us[idx], &delta));
            if idx > 0 {
                delta = layer.calc_delta(&us[idx], &delta);
            }
        }
        grads.reverse();

        let scale = -self.learning_rate / T::from_f64(x.cols().max(1) as f64);
        let decay = -self.learning_rate * self.lambda;
        for (layer, (mut dw, mut db)) in self.layers.iter_mut().zip(grads) {
            let (w, _) = layer.weights();
            for (g, w) in dw.iter_mut().zip(w) {
                *g *= scale;
                *g += &(w * decay);
            }
            db.iter_mut().for_each(|g| *g *= scale);
            layer.update_w(&dw, &db);
        }

        tracing::debug!(loss = %loss, batch = x.cols(), "train step");
        loss
    }

    /// Runs `iterations` steps over consecutive column blocks of `(x, d)`,
    /// wrapping around, and calls `callback(self, iteration)` after each.
    pub fn learning(
        &mut self,
        x: &Matrix<T>,
        d: &Matrix<T>,
        iterations: usize,
        mut callback: impl FnMut(&mut Self, usize),
    ) {
        let samples = x.cols();
        if samples == 0 {
            return;
        }
        let batch = self.batch_size.min(samples);
        for it in 0..iterations {
            let start = (it * batch) % samples;
            let width = batch.min(samples - start);
            let xb = x.sub(0, start, x.rows(), width);
            let db = d.sub(0, start, d.rows(), width);
            self.train_step(&xb, &db);
            callback(self, it);
        }
    }

    /// Averages every layer's parameters over the outer group.
    pub fn param_mix(&mut self) {
        for layer in &mut self.layers {
            layer.param_mix();
        }
    }

    /// Writes `layer_{i}.bin` for every layer into `dir`.
    ///
    /// Collective over the inner group; only rank 0 writes.
    ///
    /// # Errors
    /// The first I/O failure.
    pub fn save(&self, dir: &Path) -> Result<()> {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.output_w(&dir.join(format!("layer_{i}.bin")))?;
        }
        tracing::info!(dir = %dir.display(), layers = self.layers.len(), "saved network");
        Ok(())
    }

    /// Reads the files written by [`Sequential::save`].
    ///
    /// # Errors
    /// The first I/O or length failure.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.set_w(&dir.join(format!("layer_{i}.bin")))?;
        }
        tracing::info!(dir = %dir.display(), layers = self.layers.len(), "loaded network");
        Ok(())
    }
}

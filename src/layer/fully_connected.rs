use std::ops::Range;
use std::path::Path;

use rand_chacha::ChaCha8Rng;

use super::{Gradient, Layer, LayerCore, LayerShape, glorot, shared_rng, uniform};
use crate::comm::{WorkerContext, all_gather_real, all_reduce_real, gather_units};
use crate::error::Result;
use crate::function::SharedFunction;
use crate::matrix::{Matrix, gemm};
use crate::modelio::{read_params, write_params};
use crate::real::Real;

/// Dense layer: output map `i` is `W[i] · U + b[i]`.
///
/// Each worker holds the rows of `W[i]` and `b[i]` for its slice of output
/// units. Parameter files always hold the full matrices, in
/// `W[0..num_map]`, `b[0..num_map]` order, so they are independent of the
/// worker count.
#[derive(Debug, Clone)]
pub struct FullyConnected<T: Real> {
    core: LayerCore<T>,
    shape: LayerShape,
}

impl<T: Real> FullyConnected<T> {
    /// Maps `prev_num_map × prev_num_unit` inputs to `num_map × num_unit`
    /// outputs.
    pub fn new(
        prev_num_map: usize,
        prev_num_unit: usize,
        num_map: usize,
        num_unit: usize,
        func: SharedFunction<T>,
    ) -> Self {
        let shape = LayerShape { prev_num_map, prev_num_unit, num_map, num_unit };
        let fan_in = shape.input_rows();
        let w = (0..num_map).map(|_| Matrix::zeros(num_unit, fan_in)).collect();
        let b = (0..num_map).map(|_| Matrix::zeros(num_unit, 1)).collect();
        Self { core: LayerCore::new(func, w, b), shape }
    }

    fn owned(&self) -> Range<usize> {
        self.core.ctx.slice(self.shape.num_unit)
    }

    /// Rows of map `i` that this worker owns, taken from a full stacked δ.
    fn local_delta(&self, delta: &Matrix<T>, i: usize, range: &Range<usize>) -> Matrix<T> {
        delta.sub(i * self.shape.num_unit + range.start, 0, range.len(), delta.cols())
    }

    fn full_shapes(&self) -> Vec<(usize, usize)> {
        let (rows, fan_in) = (self.shape.num_unit, self.shape.input_rows());
        let mut shapes = vec![(rows, fan_in); self.shape.num_map];
        shapes.extend(std::iter::repeat_n((rows, 1), self.shape.num_map));
        shapes
    }
}

impl<T: Real> Layer<T> for FullyConnected<T> {
    fn name(&self) -> &'static str {
        "fully_connected"
    }

    fn shape(&self) -> LayerShape {
        self.shape
    }

    fn core(&self) -> &LayerCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LayerCore<T> {
        &mut self.core
    }

    fn init(&mut self, rng: &mut ChaCha8Rng, ctx: &WorkerContext) {
        self.core.ctx = ctx.clone();
        let mut local = shared_rng(rng, ctx);
        let fan_in = self.shape.input_rows();
        let bound = glorot(fan_in, self.shape.num_unit);
        let range = self.owned();

        // draw the full matrix so every worker count sees the same values
        self.core.w = (0..self.shape.num_map)
            .map(|_| {
                let full: Matrix<T> = uniform(&mut local, self.shape.num_unit, fan_in, bound);
                full.sub(range.start, 0, range.len(), fan_in)
            })
            .collect();
        self.core.b = (0..self.shape.num_map).map(|_| Matrix::zeros(range.len(), 1)).collect();
    }

    fn apply(&mut self, u: &Matrix<T>, use_func: bool) -> Matrix<T> {
        debug_assert_eq!(u.rows(), self.shape.input_rows(), "fully_connected input rows");
        let range = self.owned();
        let (my, batch) = (range.len(), u.cols());

        let mut local = Matrix::zeros(self.shape.num_map * my, batch);
        for (i, (w, b)) in self.core.w.iter().zip(&self.core.b).enumerate() {
            let mut y = w * u;
            y.add_col(b.as_slice());
            local.set_sub(i * my, 0, &y);
        }

        let ctx = &self.core.ctx;
        ctx.flops.add(self.shape.num_map as u64 * (gemm::flops(my, u.rows(), batch) + (my * batch) as u64));
        let out = gather_units(&*ctx.inner, &local, self.shape.num_map, &ctx.partition(self.shape.num_unit));
        self.core.activate(out, use_func)
    }

    fn calc_delta(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Matrix<T> {
        let range = self.owned();
        let mut nx = Matrix::zeros(self.shape.input_rows(), delta.cols());
        for (i, w) in self.core.w.iter().enumerate() {
            let d = self.local_delta(delta, i, &range);
            w.t().mult(T::one(), &d, T::one(), &mut nx);
        }
        all_reduce_real(&*self.core.ctx.inner, nx.as_mut_slice());

        self.core.ctx.flops.add(
            self.shape.num_map as u64 * (gemm::flops(nx.rows(), range.len(), nx.cols()) + nx.as_slice().len() as u64),
        );
        nx.hadamard(&self.core.prev_func.apply(u, true))
    }

    fn calc_gradient(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Gradient<T> {
        let range = self.owned();
        let u_appl = self.core.prev_func.apply(u, false);

        (0..self.shape.num_map)
            .map(|i| {
                let d = self.local_delta(delta, i, &range);
                self.core.ctx.flops.add(gemm::flops(d.rows(), d.cols(), u_appl.rows()));
                (&d * u_appl.t(), d.row_sums())
            })
            .unzip()
    }

    /// Gathers every worker's rows, then rank 0 writes the full matrices.
    ///
    /// Collective over the inner group.
    fn output_w(&self, path: &Path) -> Result<()> {
        let inner = &*self.core.ctx.inner;
        let (rows, fan_in) = (self.shape.num_unit, self.shape.input_rows());
        let full: Vec<Matrix<T>> = self
            .core
            .w
            .iter()
            .map(|w| Matrix::from_vec(rows, fan_in, all_gather_real(inner, w.as_slice())))
            .chain(self.core.b.iter().map(|b| Matrix::from_vec(rows, 1, all_gather_real(inner, b.as_slice()))))
            .collect();

        if inner.rank() != 0 {
            return Ok(());
        }
        write_params(path, &full.iter().collect::<Vec<_>>())
    }

    /// Reads the full matrices and keeps this worker's rows.
    fn set_w(&mut self, path: &Path) -> Result<()> {
        let range = self.owned();
        let mut full = read_params::<T>(path, &self.full_shapes())?;
        let biases = full.split_off(self.shape.num_map);
        self.core.w = full.iter().map(|w| w.sub(range.start, 0, range.len(), w.cols())).collect();
        self.core.b = biases.iter().map(|b| b.sub(range.start, 0, range.len(), 1)).collect();
        Ok(())
    }
}

use rand_chacha::ChaCha8Rng;

use super::{Gradient, Layer, LayerCore, LayerShape, shared_rng, uniform};
use crate::comm::{WorkerContext, all_reduce_real, gather_units};
use crate::function::SharedFunction;
use crate::matrix::Matrix;
use crate::ops::{BnGeometry, dispatch};
use crate::real::Real;

/// Variance guard added before every square root.
pub const EPS: f64 = 1e-8;

/// Per-channel batch normalization.
///
/// For every map `i` and unit `j`, samples are normalized with the batch
/// mean and biased variance of that `(i, j)` row, then scaled by `W(0, i)`
/// and shifted by `b(0, i)`:
///
/// ```text
/// out = W(0,i) · (x − mean(i,j)) / √(var(i,j) + ε) + b(0,i)
/// ```
///
/// Statistics always come from the current batch; there is no running
/// average and no inference mode. The statistics of the last
/// [`apply`](Layer::apply) are kept for the backward pass, so
/// `calc_delta`/`calc_gradient` must follow the forward pass of the same
/// batch.
///
/// Each worker normalizes its slice of units; the scale and shift are
/// replicated.
#[derive(Debug, Clone)]
pub struct BatchNormalize<T: Real> {
    core: LayerCore<T>,
    num_map: usize,
    num_unit: usize,
    mean: Matrix<T>,
    var: Matrix<T>,
}

impl<T: Real> BatchNormalize<T> {
    /// `num_map` channels of `num_unit` units each; input and output shapes
    /// are equal.
    ///
    /// Until [`init`](Layer::init) the layer is the identity transform
    /// (`W = 1`, `b = 0`).
    pub fn new(num_map: usize, num_unit: usize, func: SharedFunction<T>) -> Self {
        let core = LayerCore::new(func, vec![Matrix::ones(1, num_map)], vec![Matrix::zeros(1, num_map)]);
        Self { core, num_map, num_unit, mean: Matrix::default(), var: Matrix::default() }
    }

    /// Batch means of the owned units from the last forward pass,
    /// `num_map × my_size`.
    pub fn mean(&self) -> &Matrix<T> {
        &self.mean
    }

    /// Biased batch variances matching [`BatchNormalize::mean`].
    pub fn var(&self) -> &Matrix<T> {
        &self.var
    }

    fn geometry(&self, batch: usize) -> BnGeometry {
        let range = self.core.ctx.slice(self.num_unit);
        BnGeometry {
            num_map: self.num_map,
            num_unit: self.num_unit,
            offset: range.start,
            size: range.len(),
            batch,
            eps: EPS,
        }
    }

    fn gather(&self, local: &Matrix<T>) -> Matrix<T> {
        let ctx = &self.core.ctx;
        gather_units(&*ctx.inner, local, self.num_map, &ctx.partition(self.num_unit))
    }
}

impl<T: Real> Layer<T> for BatchNormalize<T> {
    fn name(&self) -> &'static str {
        "batch_normalize"
    }

    fn shape(&self) -> LayerShape {
        LayerShape {
            prev_num_map: self.num_map,
            prev_num_unit: self.num_unit,
            num_map: self.num_map,
            num_unit: self.num_unit,
        }
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
        self.core.w = vec![uniform(&mut local, 1, self.num_map, 1.0)];
        self.core.b = vec![uniform(&mut local, 1, self.num_map, 1.0)];

        let size = ctx.slice(self.num_unit).len();
        self.mean = Matrix::zeros(self.num_map, size);
        self.var = Matrix::zeros(self.num_map, size);
    }

    fn apply(&mut self, u: &Matrix<T>, use_func: bool) -> Matrix<T> {
        debug_assert_eq!(u.rows(), self.num_map * self.num_unit, "batch_normalize input rows");
        let g = self.geometry(u.cols());
        let _span = tracing::debug_span!("bn_apply", maps = g.num_map, units = g.size, batch = g.batch).entered();

        let (mean, var) = dispatch::bn_mean_var(u, &g);
        let local = dispatch::bn_apply(u, &mean, &var, &self.core.w[0], &self.core.b[0], &g);
        self.mean = mean;
        self.var = var;

        self.core.ctx.flops.add((g.num_map * g.batch * g.size * 9) as u64);
        let out = self.gather(&local);
        self.core.activate(out, use_func)
    }

    fn calc_delta(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Matrix<T> {
        let g = self.geometry(u.cols());
        debug_assert_eq!(self.mean.shape(), (g.num_map, g.size), "calc_delta before apply");
        let _span = tracing::debug_span!("bn_delta", maps = g.num_map, units = g.size, batch = g.batch).entered();

        let (u_appl, u_diff) = self.core.prev_activation(u);
        let local = dispatch::bn_delta(&u_appl, &u_diff, delta, &self.mean, &self.var, &self.core.w[0], &g);

        let n = g.batch as u64;
        self.core.ctx.flops.add((g.num_map * g.size) as u64 * n * (n * 4 + 21));
        self.gather(&local)
    }

    fn calc_gradient(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Gradient<T> {
        let g = self.geometry(u.cols());
        debug_assert_eq!(self.mean.shape(), (g.num_map, g.size), "calc_gradient before apply");

        let u_appl = self.core.prev_func.apply(u, false);
        let (dw, db) = dispatch::bn_grad(&u_appl, delta, &self.mean, &self.var, &g);

        // one reduction for both halves
        let mut buf = dw;
        buf.extend(db);
        all_reduce_real(&*self.core.ctx.inner, &mut buf);
        let db = buf.split_off(self.num_map);

        self.core.ctx.flops.add((g.num_map * g.size * g.batch * 6) as u64);
        (vec![Matrix::from_vec(1, self.num_map, buf)], vec![Matrix::from_vec(1, self.num_map, db)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::identity;
    use rand::SeedableRng;

    #[test]
    fn normalizes_each_row() {
        let mut bn = BatchNormalize::<f64>::new(1, 2, identity());
        let u = Matrix::from_vec(2, 4, vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0]);
        let out = bn.apply(&u, false);
        for i in 0..2 {
            let row = out.row(i);
            let mean: f64 = row.iter().sum::<f64>() / 4.0;
            let var: f64 = row.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 4.0;
            assert!(mean.abs() < 1e-12);
            assert!((var - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn init_draws_replicated_params_in_range() {
        let mut bn = BatchNormalize::<f32>::new(3, 5, identity());
        bn.init(&mut ChaCha8Rng::seed_from_u64(4), &WorkerContext::single());
        let (w, b) = bn.weights();
        assert_eq!(w[0].shape(), (1, 3));
        assert_eq!(b[0].shape(), (1, 3));
        assert!(w[0].as_slice().iter().chain(b[0].as_slice()).all(|x| (-1.0..1.0).contains(x)));
        assert_eq!(bn.mean().shape(), (3, 5));
    }

    #[test]
    fn counts_forward_flops() {
        let mut bn = BatchNormalize::<f64>::new(2, 3, identity());
        let ctx = WorkerContext::single();
        bn.init(&mut ChaCha8Rng::seed_from_u64(0), &ctx);
        bn.apply(&Matrix::ones(6, 4), true);
        assert_eq!(ctx.flops.read(), 2 * 4 * 3 * 9);
    }
}

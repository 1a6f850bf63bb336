use std::ops::Range;

use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::{Gradient, Layer, LayerCore, LayerShape};
use crate::comm::{WorkerContext, all_reduce_real, gather_units};
use crate::function::SharedFunction;
use crate::matrix::Matrix;
use crate::real::Real;

/// Reduction applied over each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// Largest value; δ flows to the first maximum.
    #[default]
    Max,
    /// Mean over the in-bounds part of the window.
    Average,
}

/// Geometry of a pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
    /// Channels, pooled independently.
    pub maps: usize,
    /// Input height.
    pub in_height: usize,
    /// Input width.
    pub in_width: usize,
    /// Window height.
    pub window_height: usize,
    /// Window width.
    pub window_width: usize,
    /// Step between windows.
    pub stride: usize,
}

impl PoolShape {
    /// `(in_height − 1) / stride + 1`.
    pub fn out_height(&self) -> usize {
        self.in_height.saturating_sub(1) / self.stride + 1
    }

    /// `(in_width − 1) / stride + 1`.
    pub fn out_width(&self) -> usize {
        self.in_width.saturating_sub(1) / self.stride + 1
    }

    /// Units per input channel.
    pub fn in_units(&self) -> usize {
        self.in_height * self.in_width
    }

    /// Units per output channel.
    pub fn out_units(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Input units under the window of output position `pos`, clipped at
    /// the border.
    fn window(&self, pos: usize) -> impl Iterator<Item = usize> + '_ {
        let (oy, ox) = (pos / self.out_width(), pos % self.out_width());
        let (y0, x0) = (oy * self.stride, ox * self.stride);
        let ys = y0..(y0 + self.window_height).min(self.in_height);
        let xs = x0..(x0 + self.window_width).min(self.in_width);
        ys.flat_map(move |y| xs.clone().map(move |x| y * self.in_width + x))
    }
}

/// Parameter-free max or average pooling.
///
/// The parameter file of a pooling layer is empty.
#[derive(Debug, Clone)]
pub struct Pooling<T: Real> {
    core: LayerCore<T>,
    pool: PoolShape,
    mode: PoolMode,
}

impl<T: Real> Pooling<T> {
    /// A pooling layer of the given geometry.
    ///
    /// # Panics
    /// If the stride or a window side is zero.
    pub fn new(pool: PoolShape, mode: PoolMode, func: SharedFunction<T>) -> Self {
        assert!(pool.stride > 0, "pooling stride must be positive");
        assert!(pool.window_height > 0 && pool.window_width > 0, "empty pooling window");
        Self { core: LayerCore::new(func, Vec::new(), Vec::new()), pool, mode }
    }

    /// The geometry.
    pub fn pool_shape(&self) -> PoolShape {
        self.pool
    }

    /// The reduction.
    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    fn owned(&self) -> Range<usize> {
        self.core.ctx.slice(self.pool.out_units())
    }

    /// First input unit holding the window maximum for sample `k`.
    fn argmax(&self, z: &Matrix<T>, map: usize, pos: usize, k: usize) -> Option<usize> {
        let base = map * self.pool.in_units();
        self.pool.window(pos).fold(None, |best: Option<(usize, T)>, src| {
            let v = z[(base + src, k)];
            match best {
                Some((_, b)) if b >= v => best,
                _ => Some((src, v)),
            }
        })
        .map(|(src, _)| src)
    }
}

impl<T: Real> Layer<T> for Pooling<T> {
    fn name(&self) -> &'static str {
        "pooling"
    }

    fn shape(&self) -> LayerShape {
        LayerShape {
            prev_num_map: self.pool.maps,
            prev_num_unit: self.pool.in_units(),
            num_map: self.pool.maps,
            num_unit: self.pool.out_units(),
        }
    }

    fn core(&self) -> &LayerCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LayerCore<T> {
        &mut self.core
    }

    fn init(&mut self, _rng: &mut ChaCha8Rng, ctx: &WorkerContext) {
        self.core.ctx = ctx.clone();
    }

    fn apply(&mut self, u: &Matrix<T>, use_func: bool) -> Matrix<T> {
        debug_assert_eq!(u.rows(), self.pool.maps * self.pool.in_units(), "pooling input rows");
        let range = self.owned();
        let (my, batch) = (range.len(), u.cols());
        let mut local = Matrix::zeros(self.pool.maps * my, batch);

        if batch > 0 {
            local.as_mut_slice().par_chunks_mut(batch).enumerate().for_each(|(r, row)| {
                let (i, pos) = (r / my, range.start + r % my);
                let base = i * self.pool.in_units();
                for (k, o) in row.iter_mut().enumerate() {
                    *o = match self.mode {
                        PoolMode::Max => self
                            .pool
                            .window(pos)
                            .map(|src| u[(base + src, k)])
                            .fold(T::neg_infinity(), T::max),
                        PoolMode::Average => {
                            let (sum, n) = self
                                .pool
                                .window(pos)
                                .fold((T::zero(), 0usize), |(s, n), src| (s + u[(base + src, k)], n + 1));
                            sum / T::from_f64(n as f64)
                        }
                    };
                }
            });
        }

        let ctx = &self.core.ctx;
        ctx.flops.add((self.pool.maps * my * batch * self.pool.window_height * self.pool.window_width) as u64);
        let out = gather_units(&*ctx.inner, &local, self.pool.maps, &ctx.partition(self.pool.out_units()));
        self.core.activate(out, use_func)
    }

    fn calc_delta(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Matrix<T> {
        let range = self.owned();
        let batch = delta.cols();
        let (in_units, out_units) = (self.pool.in_units(), self.pool.out_units());
        let z = match self.mode {
            PoolMode::Max => self.core.prev_func.apply(u, false),
            PoolMode::Average => Matrix::default(),
        };

        let mut nx = Matrix::zeros(self.pool.maps * in_units, batch);
        if in_units * batch > 0 {
            nx.as_mut_slice().par_chunks_mut(in_units * batch).enumerate().for_each(|(i, dst)| {
                for pos in range.clone() {
                    for k in 0..batch {
                        let d = delta[(i * out_units + pos, k)];
                        match self.mode {
                            PoolMode::Max => {
                                if let Some(src) = self.argmax(&z, i, pos, k) {
                                    dst[src * batch + k] += d;
                                }
                            }
                            PoolMode::Average => {
                                let n = self.pool.window(pos).count();
                                let share = d / T::from_f64(n as f64);
                                for src in self.pool.window(pos) {
                                    dst[src * batch + k] += share;
                                }
                            }
                        }
                    }
                }
            });
        }

        all_reduce_real(&*self.core.ctx.inner, nx.as_mut_slice());
        nx.hadamard(&self.core.prev_func.apply(u, true))
    }

    fn calc_gradient(&self, _u: &Matrix<T>, _delta: &Matrix<T>) -> Gradient<T> {
        (Vec::new(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::identity;

    fn pool(mode: PoolMode) -> Pooling<f64> {
        let shape = PoolShape { maps: 1, in_height: 3, in_width: 3, window_height: 2, window_width: 2, stride: 2 };
        Pooling::new(shape, mode, identity())
    }

    #[test]
    fn clipped_windows() {
        let p = pool(PoolMode::Max).pool_shape();
        assert_eq!(p.out_units(), 4);
        assert_eq!(p.window(0).collect::<Vec<_>>(), vec![0, 1, 3, 4]);
        assert_eq!(p.window(3).collect::<Vec<_>>(), vec![8]);
    }

    #[test]
    fn max_and_average_forward() {
        let u = Matrix::from_vec(9, 1, (1..=9).map(f64::from).collect());
        assert_eq!(pool(PoolMode::Max).apply(&u, false).as_slice(), &[5.0, 6.0, 8.0, 9.0]);
        assert_eq!(pool(PoolMode::Average).apply(&u, false).as_slice(), &[3.0, 4.5, 7.5, 9.0]);
    }

    #[test]
    fn max_routes_delta_to_winner() {
        let u = Matrix::from_vec(9, 1, (1..=9).map(f64::from).collect());
        let delta = Matrix::from_vec(4, 1, vec![1.0, 2.0, 3.0, 4.0]);
        let nx = pool(PoolMode::Max).calc_delta(&u, &delta);
        assert_eq!(nx.as_slice(), &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn has_no_parameters() {
        let p = pool(PoolMode::Average);
        let (dw, db) = p.calc_gradient(&Matrix::zeros(9, 1), &Matrix::zeros(4, 1));
        assert!(dw.is_empty() && db.is_empty());
        assert!(p.weights().0.is_empty());
    }
}

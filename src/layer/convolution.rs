use std::ops::Range;

use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::{Gradient, Layer, LayerCore, LayerShape, glorot, shared_rng, uniform};
use crate::comm::{WorkerContext, all_reduce_real, gather_units};
use crate::function::SharedFunction;
use crate::matrix::{Matrix, gemm};
use crate::real::Real;

/// Geometry of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    /// Input channels.
    pub in_maps: usize,
    /// Input height.
    pub in_height: usize,
    /// Input width.
    pub in_width: usize,
    /// Output channels.
    pub out_maps: usize,
    /// Kernel height.
    pub kernel_height: usize,
    /// Kernel width.
    pub kernel_width: usize,
    /// Step between windows.
    pub stride: usize,
    /// Zero padding on every border.
    pub pad: usize,
}

impl ConvShape {
    /// `(in_height + 2·pad − kernel_height) / stride + 1`.
    pub fn out_height(&self) -> usize {
        (self.in_height + 2 * self.pad - self.kernel_height) / self.stride + 1
    }

    /// `(in_width + 2·pad − kernel_width) / stride + 1`.
    pub fn out_width(&self) -> usize {
        (self.in_width + 2 * self.pad - self.kernel_width) / self.stride + 1
    }

    /// Units per input channel.
    pub fn in_units(&self) -> usize {
        self.in_height * self.in_width
    }

    /// Units per output channel.
    pub fn out_units(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Length of one unrolled receptive field.
    pub fn patch(&self) -> usize {
        self.in_maps * self.kernel_height * self.kernel_width
    }

    /// Input unit under kernel tap `(t, s)` of output position `(oy, ox)`,
    /// or `None` in the padding.
    fn source(&self, oy: usize, ox: usize, t: usize, s: usize) -> Option<usize> {
        let iy = (oy * self.stride + t).checked_sub(self.pad)?;
        let ix = (ox * self.stride + s).checked_sub(self.pad)?;
        (iy < self.in_height && ix < self.in_width).then_some(iy * self.in_width + ix)
    }
}

/// 2D convolution with one shared kernel bank.
///
/// `W[0]` is `out_maps × (in_maps · kh · kw)`, row `o` holding the kernel of
/// output map `o` unrolled as `(in_map, tap_y, tap_x)`. `b[0]` is
/// `out_maps × 1`. Parameters are replicated; each worker convolves its
/// slice of output positions.
#[derive(Debug, Clone)]
pub struct Convolution<T: Real> {
    core: LayerCore<T>,
    conv: ConvShape,
}

impl<T: Real> Convolution<T> {
    /// A convolution of the given geometry.
    ///
    /// # Panics
    /// If the stride is zero or a padded input is smaller than the kernel.
    pub fn new(conv: ConvShape, func: SharedFunction<T>) -> Self {
        assert!(conv.stride > 0, "convolution stride must be positive");
        assert!(
            conv.in_height + 2 * conv.pad >= conv.kernel_height && conv.in_width + 2 * conv.pad >= conv.kernel_width,
            "kernel larger than padded input"
        );
        let w = vec![Matrix::zeros(conv.out_maps, conv.patch())];
        let b = vec![Matrix::zeros(conv.out_maps, 1)];
        Self { core: LayerCore::new(func, w, b), conv }
    }

    /// The geometry.
    pub fn conv_shape(&self) -> ConvShape {
        self.conv
    }

    fn owned(&self) -> Range<usize> {
        self.core.ctx.slice(self.conv.out_units())
    }

    /// Unrolls the receptive fields of the owned output positions:
    /// `patch × (my · batch)`, column `p · batch + k`.
    fn im2col(&self, z: &Matrix<T>, range: &Range<usize>) -> Matrix<T> {
        let c = self.conv;
        let (batch, my) = (z.cols(), range.len());
        let taps = c.kernel_height * c.kernel_width;
        let width = my * batch;
        let mut cols = Matrix::zeros(c.patch(), width);
        if width == 0 {
            return cols;
        }

        cols.as_mut_slice().par_chunks_mut(width).enumerate().for_each(|(r, row)| {
            let (j, t, s) = (r / taps, (r % taps) / c.kernel_width, r % c.kernel_width);
            for p in 0..my {
                let pos = range.start + p;
                if let Some(src) = c.source(pos / c.out_width(), pos % c.out_width(), t, s) {
                    row[p * batch..(p + 1) * batch].copy_from_slice(z.row(j * c.in_units() + src));
                }
            }
        });
        cols
    }

    /// Scatters unrolled columns back onto the input grid, summing overlaps.
    fn col2im(&self, cols: &Matrix<T>, range: &Range<usize>, batch: usize) -> Matrix<T> {
        let c = self.conv;
        let taps = c.kernel_height * c.kernel_width;
        let chunk = c.in_units() * batch;
        let mut out = Matrix::zeros(c.in_maps * c.in_units(), batch);
        if chunk == 0 {
            return out;
        }

        // one task per input map; maps never share destination rows
        out.as_mut_slice().par_chunks_mut(chunk).enumerate().for_each(|(j, dst)| {
            for tap in 0..taps {
                let (t, s) = (tap / c.kernel_width, tap % c.kernel_width);
                let src_row = cols.row(j * taps + tap);
                for p in 0..range.len() {
                    let pos = range.start + p;
                    if let Some(unit) = c.source(pos / c.out_width(), pos % c.out_width(), t, s) {
                        for k in 0..batch {
                            dst[unit * batch + k] += src_row[p * batch + k];
                        }
                    }
                }
            }
        });
        out
    }

    /// Owned rows of a full stacked δ as `out_maps × (my · batch)`.
    fn local_delta(&self, delta: &Matrix<T>, range: &Range<usize>) -> Matrix<T> {
        let (my, batch) = (range.len(), delta.cols());
        let mut d = Matrix::zeros(self.conv.out_maps * my, batch);
        for i in 0..self.conv.out_maps {
            d.set_sub(i * my, 0, &delta.sub(i * self.conv.out_units() + range.start, 0, my, batch));
        }
        // (maps·my) × batch and maps × (my·batch) share one layout
        d.reshape(self.conv.out_maps, my * batch);
        d
    }
}

impl<T: Real> Layer<T> for Convolution<T> {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn shape(&self) -> LayerShape {
        LayerShape {
            prev_num_map: self.conv.in_maps,
            prev_num_unit: self.conv.in_units(),
            num_map: self.conv.out_maps,
            num_unit: self.conv.out_units(),
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
        let taps = self.conv.kernel_height * self.conv.kernel_width;
        let bound = glorot(self.conv.in_maps * taps, self.conv.out_maps * taps);
        self.core.w = vec![uniform(&mut local, self.conv.out_maps, self.conv.patch(), bound)];
        self.core.b = vec![Matrix::zeros(self.conv.out_maps, 1)];
    }

    fn apply(&mut self, u: &Matrix<T>, use_func: bool) -> Matrix<T> {
        debug_assert_eq!(u.rows(), self.conv.in_maps * self.conv.in_units(), "convolution input rows");
        let range = self.owned();
        let batch = u.cols();
        let _span = tracing::debug_span!("conv_apply", positions = range.len(), batch).entered();

        let cols = self.im2col(u, &range);
        let mut y = &self.core.w[0] * &cols;
        y.add_col(self.core.b[0].as_slice());
        y.reshape(self.conv.out_maps * range.len(), batch);

        let ctx = &self.core.ctx;
        ctx.flops.add(gemm::flops(self.conv.out_maps, self.conv.patch(), cols.cols()) + y.as_slice().len() as u64);
        let out = gather_units(&*ctx.inner, &y, self.conv.out_maps, &ctx.partition(self.conv.out_units()));
        self.core.activate(out, use_func)
    }

    fn calc_delta(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Matrix<T> {
        let range = self.owned();
        let d = self.local_delta(delta, &range);
        let dcols = self.core.w[0].t() * &d;
        let mut nx = self.col2im(&dcols, &range, delta.cols());
        all_reduce_real(&*self.core.ctx.inner, nx.as_mut_slice());

        self.core.ctx.flops.add(gemm::flops(self.conv.patch(), self.conv.out_maps, d.cols()));
        nx.hadamard(&self.core.prev_func.apply(u, true))
    }

    fn calc_gradient(&self, u: &Matrix<T>, delta: &Matrix<T>) -> Gradient<T> {
        let range = self.owned();
        let u_appl = self.core.prev_func.apply(u, false);
        let cols = self.im2col(&u_appl, &range);
        let d = self.local_delta(delta, &range);

        let mut dw = &d * cols.t();
        let mut db = d.row_sums();
        let inner = &*self.core.ctx.inner;
        all_reduce_real(inner, dw.as_mut_slice());
        all_reduce_real(inner, db.as_mut_slice());

        self.core.ctx.flops.add(gemm::flops(self.conv.out_maps, d.cols(), self.conv.patch()));
        (vec![dw], vec![db])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::identity;

    fn shape(in_height: usize, in_width: usize, k: usize, stride: usize, pad: usize) -> ConvShape {
        ConvShape {
            in_maps: 1,
            in_height,
            in_width,
            out_maps: 1,
            kernel_height: k,
            kernel_width: k,
            stride,
            pad,
        }
    }

    #[test]
    fn output_size() {
        assert_eq!(shape(5, 5, 3, 1, 0).out_units(), 9);
        assert_eq!(shape(5, 5, 3, 1, 1).out_units(), 25);
        assert_eq!(shape(6, 6, 2, 2, 0).out_height(), 3);
    }

    #[test]
    fn padding_reads_as_zero() {
        let c = shape(2, 2, 3, 1, 1);
        assert_eq!(c.source(0, 0, 0, 0), None);
        assert_eq!(c.source(0, 0, 1, 1), Some(0));
        assert_eq!(c.source(1, 1, 2, 2), None);
    }

    #[test]
    fn box_kernel_sums_windows() {
        let mut conv = Convolution::<f64>::new(shape(3, 3, 2, 1, 0), identity());
        conv.core.w = vec![Matrix::ones(1, 4)];
        conv.core.b = vec![Matrix::from_vec(1, 1, vec![1.0])];
        let u = Matrix::from_vec(9, 1, (1..=9).map(f64::from).collect());
        let out = conv.apply(&u, false);
        assert_eq!(out.as_slice(), &[13.0, 17.0, 25.0, 29.0]);
    }

    #[test]
    fn col2im_inverts_counts() {
        // every input unit is covered once per window containing it
        let conv = Convolution::<f64>::new(shape(3, 3, 2, 1, 0), identity());
        let range = 0..4;
        let cols = Matrix::ones(4, 4);
        let counts = conv.col2im(&cols, &range, 1);
        assert_eq!(counts.as_slice(), &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
    }
}

//! General matrix multiply.
//!
//! Every product in the crate ends up in [`gemm`]. Operands are lowered to
//! an [`Operand`]: a buffer plus logical extents and row/column strides. A
//! plain matrix has strides `(cols, 1)`; a [`Transposed`] view swaps them to
//! `(1, owner_cols)`. The four call shapes (plain or transposed on either
//! side) therefore reach each backend as stride pairs, which is exactly how
//! `matrixmultiply` and `ndarray` express transpose flags, and the naive
//! loop reads through the same strides.

use core::ops::Mul;

use rayon::prelude::*;

use super::{Matrix, Transposed};
use crate::backend::{get_gemm_backend, GemmBackend};
use crate::real::Real;

/// Strided, read-only view of a multiply operand.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a, T> {
    data: &'a [T],
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a, T: Real> Operand<'a, T> {
    /// Logical row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Logical column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> T {
        self.data[i * self.row_stride + j * self.col_stride]
    }

    #[cfg(any(feature = "blas", feature = "ndarray"))]
    fn strided(&self) -> (&'a [T], usize, usize) {
        (self.data, self.row_stride, self.col_stride)
    }
}

/// Anything that can appear on either side of a product.
pub trait AsOperand<T> {
    /// Strided view of `self`.
    fn operand(&self) -> Operand<'_, T>;
}

impl<T: Real> AsOperand<T> for Matrix<T> {
    fn operand(&self) -> Operand<'_, T> {
        Operand {
            data: self.as_slice(),
            rows: self.rows(),
            cols: self.cols(),
            row_stride: self.cols(),
            col_stride: 1,
        }
    }
}

impl<T: Real> AsOperand<T> for Transposed<'_, T> {
    fn operand(&self) -> Operand<'_, T> {
        let owner = self.t();
        Operand {
            data: owner.as_slice(),
            rows: owner.cols(),
            cols: owner.rows(),
            row_stride: 1,
            col_stride: owner.cols(),
        }
    }
}

impl<T: Real, O: AsOperand<T>> AsOperand<T> for &O {
    fn operand(&self) -> Operand<'_, T> {
        (**self).operand()
    }
}

/// `c := alpha * (a · b) + beta * c` with the given strategy.
///
/// When `beta` is zero the previous contents of `c` are ignored, so
/// uninitialized or non-finite values never leak into the result. Empty
/// outputs return immediately; an empty inner dimension only scales `c`.
/// Strategies not compiled into the build fall back to
/// [`GemmBackend::Naive`].
///
/// # Panics
/// In debug builds, if `a.cols != b.rows` or `c` is not `a.rows × b.cols`.
pub fn gemm<T: Real>(
    strategy: GemmBackend,
    alpha: T,
    a: Operand<'_, T>,
    b: Operand<'_, T>,
    beta: T,
    c: &mut Matrix<T>,
) {
    let (m, k, n) = (a.rows, a.cols, b.cols);
    debug_assert_eq!(k, b.rows, "gemm inner dimension mismatch");
    debug_assert_eq!(c.shape(), (m, n), "gemm output shape mismatch");

    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        scale(beta, c);
        return;
    }

    match strategy {
        GemmBackend::Blas => {
            #[cfg(feature = "blas")]
            {
                T::gemm_blas(m, k, n, alpha, a.strided(), b.strided(), beta, c.as_mut_slice());
                return;
            }
        }
        GemmBackend::Expr => {
            #[cfg(feature = "ndarray")]
            {
                T::gemm_expr(m, k, n, alpha, a.strided(), b.strided(), beta, c.as_mut_slice());
                return;
            }
        }
        GemmBackend::Naive => {}
    }

    naive(alpha, a, b, beta, c);
}

fn scale<T: Real>(beta: T, c: &mut Matrix<T>) {
    if beta == T::zero() {
        c.as_mut_slice().fill(T::zero());
    } else {
        *c *= beta;
    }
}

/// Row-parallel triple loop.
fn naive<T: Real>(alpha: T, a: Operand<'_, T>, b: Operand<'_, T>, beta: T, c: &mut Matrix<T>) {
    let (k, n) = (a.cols, b.cols);
    let overwrite = beta == T::zero();

    c.as_mut_slice().par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, out) in row.iter_mut().enumerate() {
            let mut acc = T::zero();
            for l in 0..k {
                acc = a.at(i, l).mul_add(b.at(l, j), acc);
            }
            *out = if overwrite { alpha * acc } else { alpha * acc + beta * *out };
        }
    });
}

/// `a · b` into a fresh matrix using the process-wide strategy.
pub fn multiply<T: Real>(a: Operand<'_, T>, b: Operand<'_, T>) -> Matrix<T> {
    let mut c = Matrix::zeros(a.rows, b.cols);
    gemm(get_gemm_backend(), T::one(), a, b, T::zero(), &mut c);
    c
}

impl<T: Real> Mul<&Matrix<T>> for &Matrix<T> {
    type Output = Matrix<T>;

    fn mul(self, rhs: &Matrix<T>) -> Matrix<T> {
        multiply(self.operand(), rhs.operand())
    }
}

impl<'b, T: Real> Mul<Transposed<'b, T>> for &Matrix<T> {
    type Output = Matrix<T>;

    fn mul(self, rhs: Transposed<'b, T>) -> Matrix<T> {
        multiply(self.operand(), rhs.operand())
    }
}

impl<'a, T: Real> Mul<&Matrix<T>> for Transposed<'a, T> {
    type Output = Matrix<T>;

    fn mul(self, rhs: &Matrix<T>) -> Matrix<T> {
        multiply(self.operand(), rhs.operand())
    }
}

impl<'a, 'b, T: Real> Mul<Transposed<'b, T>> for Transposed<'a, T> {
    type Output = Matrix<T>;

    fn mul(self, rhs: Transposed<'b, T>) -> Matrix<T> {
        multiply(self.operand(), rhs.operand())
    }
}

/// Number of floating point operations in an `m×k` by `k×n` product.
pub fn flops(m: usize, k: usize, n: usize) -> u64 {
    (m * n * (2 * k).saturating_sub(1)) as u64
}

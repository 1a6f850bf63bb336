//! Lazy transpose.

use core::ops::Index;

use super::{AsOperand, Matrix};
use crate::real::Real;

/// Borrowed, read-only transpose of a [`Matrix`].
///
/// Indexing remaps `(i, j)` to `(j, i)` of the owner. As a multiply operand
/// the transpose is folded into the operand strides, so no copy is made.
#[derive(Debug, Clone, Copy)]
pub struct Transposed<'a, T> {
    inner: &'a Matrix<T>,
}

impl<'a, T: Real> Transposed<'a, T> {
    /// Wraps `inner`.
    pub fn new(inner: &'a Matrix<T>) -> Self {
        Self { inner }
    }

    /// Logical row count (the owner's column count).
    pub fn rows(&self) -> usize {
        self.inner.cols()
    }

    /// Logical column count (the owner's row count).
    pub fn cols(&self) -> usize {
        self.inner.rows()
    }

    /// Undoes the transpose.
    pub fn t(&self) -> &'a Matrix<T> {
        self.inner
    }

    /// Materializes the transpose into a new matrix.
    pub fn to_matrix(&self) -> Matrix<T> {
        Matrix::from_fn(self.rows(), self.cols(), |i, j| self.inner[(j, i)])
    }

    /// Fused `c := alpha * (self · b) + beta * c`.
    pub fn mult<B: AsOperand<T>>(&self, alpha: T, b: &B, beta: T, c: &mut Matrix<T>) {
        super::gemm::gemm(crate::backend::get_gemm_backend(), alpha, self.operand(), b.operand(), beta, c);
    }
}

impl<T: Real> Index<(usize, usize)> for Transposed<'_, T> {
    type Output = T;

    fn index(&self, (i, j): (usize, usize)) -> &T {
        &self.inner[(j, i)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_indices() {
        let m = Matrix::from_vec(2, 3, vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = m.t();
        assert_eq!((t.rows(), t.cols()), (3, 2));
        assert_eq!(t[(2, 1)], 6.0);
        assert_eq!(t.to_matrix().as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn double_transpose_is_identity() {
        let m = Matrix::from_fn(3, 4, |i, j| (i * 7 + j) as f32);
        assert_eq!(m.t().t(), &m);
        assert_eq!(m.t().to_matrix().t().to_matrix(), m);
    }
}

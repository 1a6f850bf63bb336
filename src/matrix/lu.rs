//! LU decomposition with partial pivoting and forward/backward substitution.

use super::Matrix;
use crate::real::Real;

/// Packed `PA = LU` factorization of a square matrix.
///
/// `L` (unit diagonal, strictly below) and `U` (on and above the diagonal)
/// share one buffer; `perm[i]` is the source row of row `i`.
#[derive(Debug, Clone)]
pub struct LuDecomposition<T> {
    lu: Matrix<T>,
    perm: Vec<usize>,
}

impl<T: Real> LuDecomposition<T> {
    /// Factorizes `a`. Returns `None` when a pivot is exactly zero.
    ///
    /// # Panics
    /// If `a` is not square.
    pub fn new(a: &Matrix<T>) -> Option<Self> {
        assert_eq!(a.rows(), a.cols(), "LU needs a square matrix");
        let n = a.rows();
        let mut lu = a.clone();
        let mut perm: Vec<usize> = (0..n).collect();

        for k in 0..n {
            let pivot = (k..n).max_by(|&x, &y| {
                lu[(x, k)].abs().partial_cmp(&lu[(y, k)].abs()).unwrap_or(core::cmp::Ordering::Equal)
            })?;
            if lu[(pivot, k)] == T::zero() {
                return None;
            }
            if pivot != k {
                for j in 0..n {
                    let tmp = lu[(k, j)];
                    lu[(k, j)] = lu[(pivot, j)];
                    lu[(pivot, j)] = tmp;
                }
                perm.swap(k, pivot);
            }

            let diag = lu[(k, k)];
            for i in k + 1..n {
                let factor = lu[(i, k)] / diag;
                lu[(i, k)] = factor;
                for j in k + 1..n {
                    let upper = lu[(k, j)];
                    lu[(i, j)] -= factor * upper;
                }
            }
        }

        Some(Self { lu, perm })
    }

    /// Solves `A X = B` column by column.
    pub fn solve(&self, b: &Matrix<T>) -> Matrix<T> {
        let n = self.lu.rows();
        debug_assert_eq!(b.rows(), n, "right-hand side has the wrong height");
        let mut x = Matrix::zeros(n, b.cols());

        for col in 0..b.cols() {
            // forward: L y = P b
            let mut y: Vec<T> = self.perm.iter().map(|&p| b[(p, col)]).collect();
            for i in 0..n {
                for j in 0..i {
                    let (l, yj) = (self.lu[(i, j)], y[j]);
                    y[i] -= l * yj;
                }
            }
            // backward: U x = y
            for i in (0..n).rev() {
                for j in i + 1..n {
                    let (u, yj) = (self.lu[(i, j)], y[j]);
                    y[i] -= u * yj;
                }
                y[i] /= self.lu[(i, i)];
            }
            for (i, v) in y.into_iter().enumerate() {
                x[(i, col)] = v;
            }
        }

        x
    }
}

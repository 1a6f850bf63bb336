//! Dense row-major matrices.
//!
//! [`Matrix`] owns its buffer and has value semantics: `clone` is a deep
//! copy, moves transfer the buffer. Element access is bounds-checked in
//! debug builds only.
//!
//! Multi-channel quantities (feature maps) are stacked along the row axis:
//! a layer activation with `maps` channels of `units` each and a batch of
//! `n` samples is a `(maps * units) × n` matrix. [`Matrix::to_tensor`] and
//! [`Matrix::to_matrix`] convert between that form and one matrix per
//! channel.
//!
//! Products go through [`gemm`], which lowers both operands to strided views
//! so that a [`Transposed`] operand never gets copied.

pub mod gemm;
pub mod lu;
pub mod transpose;

use core::fmt;
use core::ops::{
    Add, AddAssign, Div, DivAssign, Index, IndexMut, Mul, MulAssign, Neg, Sub, SubAssign,
};

use rayon::prelude::*;

use crate::real::Real;

pub use gemm::{AsOperand, Operand};
pub use lu::LuDecomposition;
pub use transpose::Transposed;

/// Owned row-major matrix.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Real> Matrix<T> {
    /// A `rows × cols` matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![T::zero(); rows * cols] }
    }

    /// A `rows × cols` matrix of ones.
    pub fn ones(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![T::one(); rows * cols] }
    }

    /// The `n × n` identity.
    pub fn eye(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m[(i, i)] = T::one();
        }
        m
    }

    /// Wraps an existing row-major buffer.
    ///
    /// # Panics
    /// If `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), rows * cols, "matrix shape/data mismatch");
        Self { rows, cols, data }
    }

    /// Builds a matrix from `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Self { rows, cols, data }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Whether the matrix holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row-major view of the buffer.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable row-major view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the matrix, returning its buffer.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Row `i` as a slice.
    pub fn row(&self, i: usize) -> &[T] {
        debug_assert!(i < self.rows, "row {i} out of bounds ({} rows)", self.rows);
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Row `i` as a mutable slice.
    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        debug_assert!(i < self.rows, "row {i} out of bounds ({} rows)", self.rows);
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Lazy transpose, usable as a multiply operand.
    pub fn t(&self) -> Transposed<'_, T> {
        Transposed::new(self)
    }

    /// Copy of the `h × w` block whose top-left corner is `(y, x)`.
    pub fn sub(&self, y: usize, x: usize, h: usize, w: usize) -> Self {
        debug_assert!(y + h <= self.rows && x + w <= self.cols, "sub-block out of bounds");
        let mut out = Vec::with_capacity(h * w);
        for i in y..y + h {
            out.extend_from_slice(&self.row(i)[x..x + w]);
        }
        Self { rows: h, cols: w, data: out }
    }

    /// Writes `block` into `self` with its top-left corner at `(y, x)`.
    pub fn set_sub(&mut self, y: usize, x: usize, block: &Matrix<T>) {
        debug_assert!(
            y + block.rows <= self.rows && x + block.cols <= self.cols,
            "sub-block out of bounds"
        );
        for i in 0..block.rows {
            self.row_mut(y + i)[x..x + block.cols].copy_from_slice(block.row(i));
        }
    }

    /// Splits the stacked rows into `maps` equally tall matrices.
    ///
    /// # Panics
    /// If `maps` does not divide the row count.
    pub fn to_tensor(&self, maps: usize) -> Vec<Self> {
        assert!(maps > 0 && self.rows % maps == 0, "{maps} maps do not divide {} rows", self.rows);
        let h = self.rows / maps;
        (0..maps).map(|i| self.sub(i * h, 0, h, self.cols)).collect()
    }

    /// Stacks same-shape matrices along the row axis.
    ///
    /// # Panics
    /// If the matrices differ in shape.
    pub fn to_matrix(maps: &[Self]) -> Self {
        let Some(first) = maps.first() else {
            return Self::default();
        };
        let (h, w) = first.shape();
        let mut data = Vec::with_capacity(maps.len() * h * w);
        for m in maps {
            assert_eq!(m.shape(), (h, w), "stacked maps must share a shape");
            data.extend_from_slice(&m.data);
        }
        Self { rows: maps.len() * h, cols: w, data }
    }

    /// Elementwise product.
    pub fn hadamard(&self, other: &Self) -> Self {
        debug_assert_eq!(self.shape(), other.shape(), "hadamard shape mismatch");
        let data = self.data.par_iter().zip(other.data.par_iter()).map(|(&a, &b)| a * b).collect();
        Self { rows: self.rows, cols: self.cols, data }
    }

    /// Frobenius norm.
    pub fn norm_fro(&self) -> T {
        self.data.iter().map(|&x| x * x).sum::<T>().sqrt()
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data.iter().copied().sum()
    }

    /// Column vector of row sums.
    pub fn row_sums(&self) -> Self {
        let data = (0..self.rows).map(|i| self.row(i).iter().copied().sum()).collect();
        Self { rows: self.rows, cols: 1, data }
    }

    /// Applies `f` to every element.
    pub fn apply(&self, f: impl Fn(T) -> T + Sync + Send) -> Self {
        let data = self.data.par_iter().map(|&x| f(x)).collect();
        Self { rows: self.rows, cols: self.cols, data }
    }

    /// Clamps every element into `[lo, hi]`.
    pub fn clip(&self, lo: T, hi: T) -> Self {
        self.apply(|x| x.max(lo).min(hi))
    }

    /// Changes the logical shape, truncating or zero-extending the buffer.
    pub fn reshape(&mut self, rows: usize, cols: usize) {
        self.data.resize(rows * cols, T::zero());
        self.rows = rows;
        self.cols = cols;
    }

    /// Adds the column vector `v` to every column.
    pub fn add_col(&mut self, v: &[T]) {
        debug_assert_eq!(v.len(), self.rows, "broadcast length mismatch");
        let cols = self.cols;
        if cols == 0 {
            return;
        }
        self.data.par_chunks_mut(cols).zip(v.par_iter()).for_each(|(row, &x)| {
            row.iter_mut().for_each(|y| *y += x);
        });
    }

    /// Fused `c := alpha * (self · b) + beta * c`, see [`gemm::gemm`].
    pub fn mult<B: AsOperand<T>>(&self, alpha: T, b: &B, beta: T, c: &mut Matrix<T>) {
        gemm::gemm(crate::backend::get_gemm_backend(), alpha, self.operand(), b.operand(), beta, c);
    }

    /// LU decomposition with partial pivoting; `None` if singular.
    pub fn lu_decomp(&self) -> Option<LuDecomposition<T>> {
        LuDecomposition::new(self)
    }

    /// Solves `self · X = b`; `None` if `self` is singular.
    pub fn lu_solve(&self, b: &Matrix<T>) -> Option<Self> {
        self.lu_decomp().map(|lu| lu.solve(b))
    }
}

impl<T> Index<(usize, usize)> for Matrix<T> {
    type Output = T;

    fn index(&self, (i, j): (usize, usize)) -> &T {
        debug_assert!(i < self.rows && j < self.cols, "index ({i}, {j}) out of bounds");
        &self.data[i * self.cols + j]
    }
}

impl<T> IndexMut<(usize, usize)> for Matrix<T> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        debug_assert!(i < self.rows && j < self.cols, "index ({i}, {j}) out of bounds");
        &mut self.data[i * self.cols + j]
    }
}

impl<T: Real> AddAssign<&Matrix<T>> for Matrix<T> {
    fn add_assign(&mut self, rhs: &Matrix<T>) {
        debug_assert_eq!(self.shape(), rhs.shape(), "add shape mismatch");
        self.data.par_iter_mut().zip(rhs.data.par_iter()).for_each(|(a, &b)| *a += b);
    }
}

impl<T: Real> SubAssign<&Matrix<T>> for Matrix<T> {
    fn sub_assign(&mut self, rhs: &Matrix<T>) {
        debug_assert_eq!(self.shape(), rhs.shape(), "sub shape mismatch");
        self.data.par_iter_mut().zip(rhs.data.par_iter()).for_each(|(a, &b)| *a -= b);
    }
}

impl<T: Real> MulAssign<T> for Matrix<T> {
    fn mul_assign(&mut self, rhs: T) {
        self.data.par_iter_mut().for_each(|a| *a *= rhs);
    }
}

impl<T: Real> DivAssign<T> for Matrix<T> {
    fn div_assign(&mut self, rhs: T) {
        self.data.par_iter_mut().for_each(|a| *a /= rhs);
    }
}

impl<T: Real> Add for &Matrix<T> {
    type Output = Matrix<T>;

    fn add(self, rhs: Self) -> Matrix<T> {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl<T: Real> Sub for &Matrix<T> {
    type Output = Matrix<T>;

    fn sub(self, rhs: Self) -> Matrix<T> {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl<T: Real> Mul<T> for &Matrix<T> {
    type Output = Matrix<T>;

    fn mul(self, rhs: T) -> Matrix<T> {
        let mut out = self.clone();
        out *= rhs;
        out
    }
}

impl<T: Real> Div<T> for &Matrix<T> {
    type Output = Matrix<T>;

    fn div(self, rhs: T) -> Matrix<T> {
        let mut out = self.clone();
        out /= rhs;
        out
    }
}

impl<T: Real> Neg for &Matrix<T> {
    type Output = Matrix<T>;

    fn neg(self) -> Matrix<T> {
        self.apply(|x| -x)
    }
}

impl<T: Real> Neg for Matrix<T> {
    type Output = Matrix<T>;

    fn neg(mut self) -> Matrix<T> {
        self.data.par_iter_mut().for_each(|a| *a = -*a);
        self
    }
}

impl<T: Real> fmt::Display for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.rows {
            for (j, x) in self.row(i).iter().enumerate() {
                if j > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{x:>10.3e}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_and_set_sub_are_inverse() {
        let m = Matrix::<f64>::from_fn(4, 5, |i, j| (i * 5 + j) as f64);
        let block = m.sub(1, 2, 2, 3);
        assert_eq!(block.as_slice(), &[7.0, 8.0, 9.0, 12.0, 13.0, 14.0]);

        let mut z = Matrix::<f64>::zeros(4, 5);
        z.set_sub(1, 2, &block);
        assert_eq!(z[(2, 4)], 14.0);
        assert_eq!(z[(0, 0)], 0.0);
    }

    #[test]
    fn operators_are_elementwise() {
        let a = Matrix::from_vec(2, 2, vec![1.0f64, 2.0, 3.0, 4.0]);
        let b = Matrix::ones(2, 2);
        assert_eq!((&a + &b).as_slice(), &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!((&a - &b).as_slice(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!((&a * 2.0).as_slice(), &[2.0, 4.0, 6.0, 8.0]);
        assert_eq!((&a / 2.0).as_slice(), &[0.5, 1.0, 1.5, 2.0]);
        assert_eq!((-&a).as_slice(), &[-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(a.hadamard(&a).as_slice(), &[1.0, 4.0, 9.0, 16.0]);
    }

    #[test]
    fn norm_and_clip() {
        let a = Matrix::from_vec(1, 2, vec![3.0f64, -4.0]);
        assert_eq!(a.norm_fro(), 5.0);
        assert_eq!(a.clip(-1.0, 1.0).as_slice(), &[1.0, -1.0]);
    }

    #[test]
    fn eye_and_row_sums() {
        let i = Matrix::<f32>::eye(3);
        assert_eq!(i.row_sums().as_slice(), &[1.0, 1.0, 1.0]);
        assert_eq!(i.sum(), 3.0);
    }

    #[test]
    fn add_col_broadcasts() {
        let mut m = Matrix::<f64>::zeros(2, 3);
        m.add_col(&[1.0, -1.0]);
        assert_eq!(m.as_slice(), &[1.0, 1.0, 1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn reshape_keeps_prefix() {
        let mut m = Matrix::from_vec(2, 2, vec![1.0f64, 2.0, 3.0, 4.0]);
        m.reshape(1, 4);
        assert_eq!(m.shape(), (1, 4));
        assert_eq!(m[(0, 3)], 4.0);
    }

    #[test]
    fn display_uses_scientific_notation() {
        let m = Matrix::from_vec(1, 2, vec![1.0f64, -0.5]);
        let s = m.to_string();
        assert!(s.contains("1.000e0"));
        assert!(s.contains("-5.000e-1"));
    }

    #[test]
    #[should_panic(expected = "matrix shape/data mismatch")]
    fn from_vec_rejects_bad_length() {
        let _ = Matrix::from_vec(2, 2, vec![1.0f64; 3]);
    }
}

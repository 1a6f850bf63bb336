use super::LossFunction;
use crate::matrix::Matrix;
use crate::real::Real;

/// Half squared error, `½ Σ (y - d)²`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Square;

impl<T: Real> LossFunction<T> for Square {
    fn name(&self) -> &'static str {
        "square"
    }

    fn loss(&self, y: &Matrix<T>, d: &Matrix<T>) -> T {
        debug_assert_eq!(y.shape(), d.shape(), "loss shape mismatch");
        let half = T::from_f64(0.5);
        y.as_slice().iter().zip(d.as_slice()).map(|(&a, &b)| half * (a - b) * (a - b)).sum()
    }

    fn gradient(&self, y: &Matrix<T>, d: &Matrix<T>) -> Matrix<T> {
        y - d
    }
}

/// Cross entropy `-Σ d ln y` over a softmax output.
///
/// The gradient is taken with respect to the softmax *input*, which
/// collapses to `y - d`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl<T: Real> LossFunction<T> for CrossEntropy {
    fn name(&self) -> &'static str {
        "cross_entropy"
    }

    fn loss(&self, y: &Matrix<T>, d: &Matrix<T>) -> T {
        debug_assert_eq!(y.shape(), d.shape(), "loss shape mismatch");
        let floor = T::min_positive_value();
        -y.as_slice().iter().zip(d.as_slice()).map(|(&a, &b)| b * a.max(floor).ln()).sum::<T>()
    }

    fn gradient(&self, y: &Matrix<T>, d: &Matrix<T>) -> Matrix<T> {
        y - d
    }
}

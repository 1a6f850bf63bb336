mod common;

use briny_nn::backend::GemmBackend;
use briny_nn::matrix::{AsOperand, Matrix, gemm};
use common::{assert_close, random};

fn reference(a: &Matrix<f64>, b: &Matrix<f64>) -> Matrix<f64> {
    Matrix::from_fn(a.rows(), b.cols(), |i, j| (0..a.cols()).map(|l| a[(i, l)] * b[(l, j)]).sum())
}

fn product(strategy: GemmBackend, a: &impl AsOperand<f64>, b: &impl AsOperand<f64>) -> Matrix<f64> {
    let (a, b) = (a.operand(), b.operand());
    let mut c = Matrix::zeros(a.rows(), b.cols());
    gemm::gemm(strategy, 1.0, a, b, 0.0, &mut c);
    c
}

#[test]
fn test_naive_matches_reference() {
    let a = random(7, 5, 1);
    let b = random(5, 9, 2);
    assert_close(&product(GemmBackend::Naive, &a, &b), &reference(&a, &b), 1e-12);
}

#[test]
fn test_transposed_operands() {
    let a = random(5, 7, 3);
    let b = random(9, 5, 4);
    let (at, bt) = (a.t().to_matrix(), b.t().to_matrix());

    assert_close(&(&b * &a), &reference(&b, &a), 1e-12);
    assert_close(&(a.t() * &bt), &reference(&at, &bt), 1e-12);
    assert_close(&(&at * b.t()), &reference(&at, &bt), 1e-12);
    assert_close(&(a.t() * b.t()), &reference(&at, &bt), 1e-12);
    assert_eq!(a.t().t(), &a);
}

#[cfg(feature = "blas")]
#[test]
fn test_blas_agrees_with_naive() {
    let a = random(6, 11, 5);
    let b = random(6, 4, 6);
    assert_close(&product(GemmBackend::Blas, &a.t(), &b), &product(GemmBackend::Naive, &a.t(), &b), 1e-12);
    assert_close(&product(GemmBackend::Blas, &b.t(), &b), &product(GemmBackend::Naive, &b.t(), &b), 1e-12);
}

#[cfg(feature = "ndarray")]
#[test]
fn test_expr_agrees_with_naive() {
    let a = random(8, 3, 7);
    let b = random(5, 3, 8);
    assert_close(&product(GemmBackend::Expr, &a, &b.t()), &product(GemmBackend::Naive, &a, &b.t()), 1e-12);
}

#[test]
fn test_mult_accumulates_with_beta() {
    let a = random(3, 4, 9);
    let b = random(4, 2, 10);
    let start = random(3, 2, 11);

    let mut c = start.clone();
    a.mult(2.0, &b, 1.0, &mut c);
    let expected = &(&reference(&a, &b) * 2.0) + &start;
    assert_close(&c, &expected, 1e-12);

    // beta = 0 ignores whatever c held
    let mut poisoned = Matrix::from_fn(3, 2, |_, _| f64::NAN);
    a.mult(1.0, &b, 0.0, &mut poisoned);
    assert_close(&poisoned, &reference(&a, &b), 1e-12);
}

#[test]
fn test_transposed_mult_into_existing() {
    let a = random(4, 3, 12);
    let d = random(4, 5, 13);
    let mut c = Matrix::ones(3, 5);
    a.t().mult(1.0, &d, 1.0, &mut c);
    let expected = &reference(&a.t().to_matrix(), &d) + &Matrix::ones(3, 5);
    assert_close(&c, &expected, 1e-12);
}

#[test]
fn test_empty_inner_dimension_scales_output() {
    let a = Matrix::<f64>::zeros(2, 0);
    let b = Matrix::<f64>::zeros(0, 3);
    let mut c = Matrix::ones(2, 3);
    a.mult(1.0, &b, 3.0, &mut c);
    assert_eq!(c, &Matrix::ones(2, 3) * 3.0);
}

#[test]
fn test_tensor_round_trip() {
    let stacked = random(6, 4, 14);
    let maps = stacked.to_tensor(3);
    assert_eq!(maps.len(), 3);
    assert_eq!(maps[1], stacked.sub(2, 0, 2, 4));
    assert_eq!(Matrix::to_matrix(&maps), stacked);

    let channels = vec![random(2, 3, 15), random(2, 3, 16), random(2, 3, 17), random(2, 3, 18)];
    let merged = Matrix::to_matrix(&channels);
    assert_eq!(merged.shape(), (8, 3));
    assert_eq!(merged.to_tensor(4), channels);
}

#[test]
fn test_lu_solve() {
    let a = Matrix::from_vec(3, 3, vec![0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 3.0, 0.0, 1.0]);
    let x = random(3, 2, 15);
    let b = reference(&a, &x);
    let lu = a.lu_decomp().unwrap();
    assert_close(&lu.solve(&b), &x, 1e-12);
    assert_close(&a.lu_solve(&b).unwrap(), &x, 1e-12);

    let singular = Matrix::from_vec(2, 2, vec![1.0, 2.0, 2.0, 4.0]);
    assert!(singular.lu_decomp().is_none());
}

#[test]
fn test_flop_formula() {
    assert_eq!(gemm::flops(2, 3, 4), 2 * 4 * 5);
    assert_eq!(gemm::flops(2, 0, 4), 0);
}

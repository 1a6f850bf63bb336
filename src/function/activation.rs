use super::Function;
use crate::matrix::Matrix;
use crate::real::Real;

/// Implements [`Function`] for an elementwise activation given its value and
/// derivative as closures over one element.
macro_rules! elementwise {
    ($ty:ty, $name:literal, |$s:ident, $x:ident| $value:expr, |$ds:ident, $dx:ident| $deriv:expr) => {
        impl<T: Real> Function<T> for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn apply(&self, x: &Matrix<T>, diff: bool) -> Matrix<T> {
                if diff {
                    let $ds = self;
                    x.apply(|$dx| $deriv)
                } else {
                    let $s = self;
                    x.apply(|$x| $value)
                }
            }
        }
    };
}

/// `f(x) = x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

elementwise!(Identity, "identity", |_s, x| x, |_s, _x| T::one());

/// `max(x, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

elementwise!(
    ReLU,
    "relu",
    |_s, x| x.max(T::zero()),
    |_s, x| if x > T::zero() { T::one() } else { T::zero() }
);

/// `x` for positive inputs, `alpha * x` otherwise.
#[derive(Debug, Clone, Copy)]
pub struct LeakyReLU {
    /// Slope for non-positive inputs.
    pub alpha: f64,
}

elementwise!(
    LeakyReLU,
    "leaky_relu",
    |s, x| if x > T::zero() { x } else { T::from_f64(s.alpha) * x },
    |s, x| if x > T::zero() { T::one() } else { T::from_f64(s.alpha) }
);

/// Logistic sigmoid.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

fn sigmoid<T: Real>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

elementwise!(Sigmoid, "sigmoid", |_s, x| sigmoid(x), |_s, x| {
    let y = sigmoid(x);
    y * (T::one() - y)
});

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

elementwise!(Tanh, "tanh", |_s, x| x.tanh(), |_s, x| {
    let y = x.tanh();
    T::one() - y * y
});

/// `x / (1 + |x|)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softsign;

elementwise!(Softsign, "softsign", |_s, x| x / (T::one() + x.abs()), |_s, x| {
    let y = T::one() + x.abs();
    T::one() / (y * y)
});

/// `ln(1 + e^x)`, evaluated without overflow for large `x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softplus;

elementwise!(
    Softplus,
    "softplus",
    |_s, x| x.max(T::zero()) + (-x.abs()).exp().ln_1p(),
    |_s, x| sigmoid(x)
);

/// `x^n`.
#[derive(Debug, Clone, Copy)]
pub struct Polynomial {
    /// Exponent.
    pub n: i32,
}

elementwise!(
    Polynomial,
    "polynomial",
    |s, x| x.powi(s.n),
    |s, x| T::from_f64(f64::from(s.n)) * x.powi(s.n - 1)
);

/// `x^n` for positive inputs, zero otherwise.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedPower {
    /// Exponent.
    pub n: i32,
}

elementwise!(
    TruncatedPower,
    "truncated_power",
    |s, x| if x > T::zero() { x.powi(s.n) } else { T::zero() },
    |s, x| if x > T::zero() { T::from_f64(f64::from(s.n)) * x.powi(s.n - 1) } else { T::zero() }
);

/// `|x|`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Abs;

elementwise!(Abs, "abs", |_s, x| x.abs(), |_s, x| if x > T::zero() {
    T::one()
} else if x < T::zero() {
    -T::one()
} else {
    T::zero()
});

/// Column-wise softmax: each column (one sample) is normalized over its
/// rows.
///
/// The derivative mode returns ones: softmax is meant to be paired with
/// [`CrossEntropy`](super::CrossEntropy), whose gradient `y - d` already
/// contains the softmax Jacobian.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax;

impl<T: Real> Function<T> for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn apply(&self, x: &Matrix<T>, diff: bool) -> Matrix<T> {
        if diff {
            return Matrix::ones(x.rows(), x.cols());
        }

        let mut out = Matrix::zeros(x.rows(), x.cols());
        for k in 0..x.cols() {
            let max = (0..x.rows()).map(|i| x[(i, k)]).fold(T::neg_infinity(), T::max);
            let mut total = T::zero();
            for i in 0..x.rows() {
                let e = (x[(i, k)] - max).exp();
                out[(i, k)] = e;
                total += e;
            }
            for i in 0..x.rows() {
                out[(i, k)] /= total;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_derivative(f: &dyn Function<f64>, x: f64) -> f64 {
        let h = 1e-6;
        let plus = f.apply(&Matrix::from_vec(1, 1, vec![x + h]), false)[(0, 0)];
        let minus = f.apply(&Matrix::from_vec(1, 1, vec![x - h]), false)[(0, 0)];
        (plus - minus) / (2.0 * h)
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let funcs: Vec<Box<dyn Function<f64>>> = vec![
            Box::new(Identity),
            Box::new(ReLU),
            Box::new(LeakyReLU { alpha: 0.1 }),
            Box::new(Sigmoid),
            Box::new(Tanh),
            Box::new(Softsign),
            Box::new(Softplus),
            Box::new(Polynomial { n: 3 }),
            Box::new(TruncatedPower { n: 2 }),
            Box::new(Abs),
        ];
        for f in &funcs {
            for &x in &[-1.3, -0.4, 0.7, 2.1] {
                let analytic = f.apply(&Matrix::from_vec(1, 1, vec![x]), true)[(0, 0)];
                let numeric = numeric_derivative(f.as_ref(), x);
                assert!(
                    (analytic - numeric).abs() < 1e-5,
                    "{}: f'({x}) = {analytic}, expected {numeric}",
                    f.name()
                );
            }
        }
    }

    #[test]
    fn softmax_columns_sum_to_one() {
        let x = Matrix::from_vec(3, 2, vec![1.0f64, 1000.0, 2.0, 1000.0, 3.0, 1000.0]);
        let y = Softmax.apply(&x, false);
        for k in 0..2 {
            let s: f64 = (0..3).map(|i| y[(i, k)]).sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
        assert!((y[(0, 1)] - 1.0 / 3.0).abs() < 1e-12);
        assert!(y[(2, 0)] > y[(1, 0)]);
    }

    #[test]
    fn softplus_is_stable_for_large_inputs() {
        let y = Function::<f64>::apply(&Softplus, &Matrix::from_vec(1, 1, vec![800.0]), false);
        assert_eq!(y[(0, 0)], 800.0);
    }
}

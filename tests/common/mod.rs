#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use briny_nn::comm::ThreadGroup;
use briny_nn::layer::Layer;
use briny_nn::matrix::Matrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const H: f64 = 1e-6;

pub fn random(rows: usize, cols: usize, seed: u64) -> Matrix<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Matrix::from_fn(rows, cols, |_, _| rng.random_range(-1.0..1.0))
}

pub fn assert_close(a: &Matrix<f64>, b: &Matrix<f64>, tol: f64) {
    assert_eq!(a.shape(), b.shape(), "shape mismatch");
    for (i, (x, y)) in a.as_slice().iter().zip(b.as_slice()).enumerate() {
        assert!((x - y).abs() <= tol, "element {i}: {x} vs {y} (tol {tol})");
    }
}

pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("briny_nn_it_{}_{name}", std::process::id()))
}

/// `Σ c ⊙ layer(prev_func(u))`, the scalar probed by finite differences.
fn objective<L: Layer<f64>>(layer: &mut L, u: &Matrix<f64>, c: &Matrix<f64>) -> f64 {
    let z = layer.prev_func().apply(u, false);
    layer.apply(&z, false).hadamard(c).sum()
}

/// Compares `calc_delta` with central differences of the objective.
pub fn check_delta<L: Layer<f64>>(layer: &mut L, u: &Matrix<f64>, c: &Matrix<f64>, tol: f64) {
    objective(layer, u, c);
    let nx = layer.calc_delta(u, c);
    assert_eq!(nx.shape(), u.shape());

    for idx in 0..u.as_slice().len() {
        let mut up = u.clone();
        up.as_mut_slice()[idx] += H;
        let plus = objective(layer, &up, c);
        up.as_mut_slice()[idx] -= 2.0 * H;
        let minus = objective(layer, &up, c);
        let numeric = (plus - minus) / (2.0 * H);
        let analytic = nx.as_slice()[idx];
        assert!((numeric - analytic).abs() < tol, "{} delta[{idx}]: numeric {numeric}, analytic {analytic}", layer.name());
    }
}

/// Compares `calc_gradient` with central differences over every parameter.
pub fn check_gradient<L: Layer<f64>>(layer: &mut L, u: &Matrix<f64>, c: &Matrix<f64>, tol: f64) {
    objective(layer, u, c);
    let (dw, db) = layer.calc_gradient(u, c);
    let (w, b) = layer.weights();
    let zero_w: Vec<_> = w.iter().map(|m| Matrix::zeros(m.rows(), m.cols())).collect();
    let zero_b: Vec<_> = b.iter().map(|m| Matrix::zeros(m.rows(), m.cols())).collect();

    let probe = |layer: &mut L, is_bias: bool, m: usize, idx: usize, shift: f64| {
        let (mut pw, mut pb) = (zero_w.clone(), zero_b.clone());
        let target = if is_bias { &mut pb[m] } else { &mut pw[m] };
        target.as_mut_slice()[idx] = shift;
        layer.update_w(&pw, &pb);
        let value = objective(layer, u, c);
        target_reset(layer, &pw, &pb);
        value
    };

    for (is_bias, grads) in [(false, &dw), (true, &db)] {
        for (m, g) in grads.iter().enumerate() {
            for idx in 0..g.as_slice().len() {
                let numeric = (probe(layer, is_bias, m, idx, H) - probe(layer, is_bias, m, idx, -H)) / (2.0 * H);
                let analytic = g.as_slice()[idx];
                assert!(
                    (numeric - analytic).abs() < tol,
                    "{} {}[{m}][{idx}]: numeric {numeric}, analytic {analytic}",
                    layer.name(),
                    if is_bias { "db" } else { "dW" }
                );
            }
        }
    }
}

fn target_reset<L: Layer<f64>>(layer: &mut L, pw: &[Matrix<f64>], pb: &[Matrix<f64>]) {
    let neg_w: Vec<_> = pw.iter().map(|m| -m).collect();
    let neg_b: Vec<_> = pb.iter().map(|m| -m).collect();
    layer.update_w(&neg_w, &neg_b);
}

/// Runs `f` on every member of a fresh `n`-worker group and collects the
/// results in rank order.
pub fn run_group<R: Send + 'static>(n: usize, f: impl Fn(ThreadGroup) -> R + Send + Sync + 'static) -> Vec<R> {
    let f = Arc::new(f);
    let handles: Vec<_> = ThreadGroup::new(n)
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

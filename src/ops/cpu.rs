//! Parallel CPU batch-normalization kernels.
//!
//! Every kernel fans out over independent `(map, unit)` rows with rayon;
//! each task owns its output slots, and batch reductions are plain sums
//! inside one task.

use rayon::prelude::*;

use super::BnGeometry;
use crate::matrix::Matrix;
use crate::real::Real;

#[inline]
fn source_row(g: &BnGeometry, i: usize, j: usize) -> usize {
    i * g.num_unit + g.offset + j
}

/// Batch mean and biased variance, each `num_map × size`.
pub fn bn_mean_var<T: Real>(u: &Matrix<T>, g: &BnGeometry) -> (Matrix<T>, Matrix<T>) {
    let n = T::from_f64(g.batch as f64);
    let mut mean = Matrix::zeros(g.num_map, g.size);
    let mut var = Matrix::zeros(g.num_map, g.size);

    mean.as_mut_slice()
        .par_iter_mut()
        .zip(var.as_mut_slice().par_iter_mut())
        .enumerate()
        .for_each(|(idx, (m, v))| {
            let row = u.row(source_row(g, idx / g.size, idx % g.size));
            let mu = row.iter().copied().sum::<T>() / n;
            *m = mu;
            *v = row.iter().map(|&x| (x - mu) * (x - mu)).sum::<T>() / n;
        });

    (mean, var)
}

/// Normalized, scaled and shifted local slice, `(num_map · size) × batch`.
pub fn bn_apply<T: Real>(
    u: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    b: &Matrix<T>,
    g: &BnGeometry,
) -> Matrix<T> {
    let eps = T::from_f64(g.eps);
    let mut out = Matrix::zeros(g.num_map * g.size, g.batch);
    if g.batch == 0 {
        return out;
    }

    out.as_mut_slice().par_chunks_mut(g.batch).enumerate().for_each(|(r, row)| {
        let (i, j) = (r / g.size, r % g.size);
        let mu = mean[(i, j)];
        let sd = (var[(i, j)] + eps).sqrt();
        let (scale, shift) = (w[(0, i)], b[(0, i)]);
        for (o, &x) in row.iter_mut().zip(u.row(source_row(g, i, j))) {
            *o = scale * (x - mu) / sd + shift;
        }
    });

    out
}

/// Backward pass of the normalization for the local slice.
///
/// With `x = U_appl`, `σ = √(var + ε)`, `tmp1 = mean(δ)` and
/// `tmp2 = mean(δ·(x − mean))` over the batch:
///
/// ```text
/// nx = W/σ·δ·U_diff − W/σ·U_diff·tmp1 − W/(var + ε)^1.5·U_diff·(x − mean)·tmp2
/// ```
///
/// Both batch reductions must be complete before any sample is written.
#[allow(clippy::too_many_arguments)]
pub fn bn_delta<T: Real>(
    u_appl: &Matrix<T>,
    u_diff: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    w: &Matrix<T>,
    g: &BnGeometry,
) -> Matrix<T> {
    let eps = T::from_f64(g.eps);
    let n = T::from_f64(g.batch as f64);
    let three_halves = T::from_f64(1.5);
    let mut out = Matrix::zeros(g.num_map * g.size, g.batch);
    if g.batch == 0 {
        return out;
    }

    out.as_mut_slice().par_chunks_mut(g.batch).enumerate().for_each(|(r, row)| {
        let (i, j) = (r / g.size, r % g.size);
        let src = source_row(g, i, j);
        let (x, dx, d) = (u_appl.row(src), u_diff.row(src), delta.row(src));
        let mu = mean[(i, j)];
        let ve = var[(i, j)] + eps;

        let tmp1 = d.iter().copied().sum::<T>() / n;
        let tmp2 = d.iter().zip(x).map(|(&d, &x)| d * (x - mu)).sum::<T>() / n;

        let direct = w[(0, i)] / ve.sqrt();
        let correction = w[(0, i)] / ve.powf(three_halves);
        for (k, o) in row.iter_mut().enumerate() {
            *o = direct * d[k] * dx[k] - direct * dx[k] * tmp1 - correction * dx[k] * (x[k] - mu) * tmp2;
        }
    });

    out
}

/// Per-map partial gradient sums over the local slice: `Σ δ·(x − mean)/σ`
/// for the scale and `Σ δ` for the shift.
pub fn bn_grad<T: Real>(
    u_appl: &Matrix<T>,
    delta: &Matrix<T>,
    mean: &Matrix<T>,
    var: &Matrix<T>,
    g: &BnGeometry,
) -> (Vec<T>, Vec<T>) {
    let eps = T::from_f64(g.eps);

    (0..g.num_map)
        .map(|i| {
            (0..g.size)
                .into_par_iter()
                .map(|j| {
                    let src = source_row(g, i, j);
                    let mu = mean[(i, j)];
                    let sd = (var[(i, j)] + eps).sqrt();
                    let d = delta.row(src);
                    let dw = d.iter().zip(u_appl.row(src)).map(|(&d, &x)| d * (x - mu) / sd).sum::<T>();
                    let db = d.iter().copied().sum::<T>();
                    (dw, db)
                })
                .reduce(|| (T::zero(), T::zero()), |a, b| (a.0 + b.0, a.1 + b.1))
        })
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(num_map: usize, num_unit: usize, batch: usize) -> BnGeometry {
        BnGeometry { num_map, num_unit, offset: 0, size: num_unit, batch, eps: 1e-8 }
    }

    #[test]
    fn mean_and_biased_variance() {
        let u = Matrix::from_vec(2, 4, vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 5.0, 5.0, 5.0]);
        let (mean, var) = bn_mean_var(&u, &geometry(1, 2, 4));
        assert_eq!(mean.as_slice(), &[2.5, 5.0]);
        assert_eq!(var.as_slice(), &[1.25, 0.0]);
    }

    #[test]
    fn offset_selects_owned_rows() {
        // 2 maps × 3 units, worker owns unit 1..3
        let u = Matrix::from_fn(6, 2, |r, k| (10 * r + k) as f64);
        let g = BnGeometry { num_map: 2, num_unit: 3, offset: 1, size: 2, batch: 2, eps: 1e-8 };
        let (mean, _) = bn_mean_var(&u, &g);
        assert_eq!(mean.as_slice(), &[10.5, 20.5, 40.5, 50.5]);
    }

    #[test]
    fn delta_of_uniform_error_vanishes() {
        // a constant delta only shifts the batch, which normalization removes
        let u = Matrix::from_vec(1, 3, vec![0.0f64, 1.0, 5.0]);
        let g = geometry(1, 1, 3);
        let (mean, var) = bn_mean_var(&u, &g);
        let w = Matrix::from_vec(1, 1, vec![1.5]);
        let ones = Matrix::ones(1, 3);
        let nx = bn_delta(&u, &ones, &ones, &mean, &var, &w, &g);
        assert!(nx.as_slice().iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn shift_gradient_sums_delta() {
        let u = Matrix::from_vec(2, 2, vec![1.0f64, 3.0, -1.0, 1.0]);
        let delta = Matrix::from_vec(2, 2, vec![0.5, 0.25, 1.0, 2.0]);
        let g = geometry(1, 2, 2);
        let (mean, var) = bn_mean_var(&u, &g);
        let (dw, db) = bn_grad(&u, &delta, &mean, &var, &g);
        assert_eq!(db, vec![3.75]);
        // x̂ = ±1 (up to ε) for both rows
        assert!((dw[0] - (-0.5 + 0.25 - 1.0 + 2.0)).abs() < 1e-6);
    }
}

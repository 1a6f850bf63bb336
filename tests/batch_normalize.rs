mod common;

use std::sync::Arc;

use briny_nn::comm::{SingleWorker, ThreadGroup, WorkerContext};
use briny_nn::flops::FlopCounter;
use briny_nn::function::{Tanh, identity};
use briny_nn::layer::{BatchNormalize, Layer};
use briny_nn::matrix::Matrix;
use briny_nn::modelio::write_params;
use common::{assert_close, check_delta, check_gradient, random, temp_path};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[test]
fn test_constant_channel_outputs_shift() {
    let path = temp_path("bn_const.bin");
    let w = Matrix::from_vec(1, 2, vec![2.0f64, 2.0]);
    let b = Matrix::from_vec(1, 2, vec![1.0, 1.0]);
    write_params(&path, &[&w, &b]).unwrap();

    let mut bn = BatchNormalize::<f64>::new(2, 3, identity());
    bn.init(&mut ChaCha8Rng::seed_from_u64(0), &WorkerContext::single());
    bn.set_w(&path).unwrap();

    let u = Matrix::from_fn(6, 5, |r, _| if r < 3 { 7.0 } else { -3.0 });
    let out = bn.apply(&u, false);
    assert!(out.as_slice().iter().all(|&x| (x - 1.0).abs() < 1e-12));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_delta_matches_finite_differences() {
    let mut bn = BatchNormalize::new(2, 4, identity());
    bn.init(&mut ChaCha8Rng::seed_from_u64(3), &WorkerContext::single());
    bn.set_prev_func(Arc::new(Tanh));
    let u = random(8, 3, 10);
    let c = random(8, 3, 11);
    check_delta(&mut bn, &u, &c, 1e-4);
}

#[test]
fn test_gradient_matches_finite_differences() {
    let mut bn = BatchNormalize::new(2, 4, identity());
    bn.init(&mut ChaCha8Rng::seed_from_u64(5), &WorkerContext::single());
    bn.set_prev_func(Arc::new(Tanh));
    let u = random(8, 3, 12);
    let c = random(8, 3, 13);
    check_gradient(&mut bn, &u, &c, 1e-4);
}

#[test]
fn test_one_worker_group_matches_single() {
    let u = random(6, 4, 20);
    let delta = random(6, 4, 21);

    let mut single = BatchNormalize::new(3, 2, identity());
    single.init(&mut ChaCha8Rng::seed_from_u64(8), &WorkerContext::single());
    let expected = (single.apply(&u, true), single.calc_delta(&u, &delta), single.calc_gradient(&u, &delta));

    let comm = ThreadGroup::new(1).remove(0);
    let ctx = WorkerContext::new(Arc::new(comm), Arc::new(SingleWorker), FlopCounter::new());
    let mut grouped = BatchNormalize::new(3, 2, identity());
    grouped.init(&mut ChaCha8Rng::seed_from_u64(8), &ctx);

    assert_eq!(grouped.apply(&u, true), expected.0);
    assert_eq!(grouped.calc_delta(&u, &delta), expected.1);
    assert_eq!(grouped.calc_gradient(&u, &delta), expected.2);
}

#[test]
fn test_statistics_are_per_unit() {
    let mut bn = BatchNormalize::<f64>::new(1, 2, identity());
    let u = Matrix::from_vec(2, 2, vec![0.0, 2.0, 10.0, 30.0]);
    bn.apply(&u, false);
    assert_eq!(bn.mean().as_slice(), &[1.0, 20.0]);
    assert_eq!(bn.var().as_slice(), &[1.0, 100.0]);
}

#[test]
fn test_f32_forward_is_normalized() {
    let mut bn = BatchNormalize::<f32>::new(1, 1, identity());
    let u = Matrix::from_vec(1, 4, vec![1.0f32, 3.0, 5.0, 7.0]);
    let out = bn.apply(&u, false);
    let expected = Matrix::from_vec(1, 4, vec![-1.341_640_8f32, -0.447_213_6, 0.447_213_6, 1.341_640_8]);
    for (a, b) in out.as_slice().iter().zip(expected.as_slice()) {
        assert!((a - b).abs() < 1e-5);
    }
    assert_close(&Matrix::from_vec(1, 1, vec![f64::from(out.sum())]), &Matrix::zeros(1, 1), 1e-5);
}

//! Collective communication between cooperating workers.
//!
//! A layer running on `P` workers owns one [`partition`](crate::partition)
//! slice of its units per worker and combines partial results with two
//! blocking collectives: an all-reduce sum (gradients, scattered deltas)
//! and an all-gather (forward outputs). A second, *outer* group of
//! independent replicas is used only to average parameters
//! ([`Layer::param_mix`](crate::layer::Layer::param_mix)).
//!
//! Collectives are synchronous and have no failure handling: a worker that
//! never arrives stalls the group.
//!
//! Two communicators are provided:
//!
//! - [`SingleWorker`] — a group of one; every collective is the identity.
//! - [`ThreadGroup`] — in-process workers on separate threads, synchronized
//!   with a barrier. Reductions run in rank order so every worker sees
//!   bit-identical results.

use std::fmt::Debug;
use std::ops::Range;
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};

use crate::flops::FlopCounter;
use crate::matrix::Matrix;
use crate::partition::{self, Partition};
use crate::real::Real;

/// A fixed group of workers.
///
/// Every method is collective: all members must call it, in the same order,
/// with compatible arguments.
pub trait Communicator: Send + Sync + Debug {
    /// Rank of this worker within the group.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// Returns the `value` passed by `root` on every worker.
    fn broadcast_u64(&self, value: u64, root: usize) -> u64;

    /// Replaces `buf` with the element-wise sum over all workers.
    fn all_reduce_sum(&self, buf: &mut [f64]);

    /// Concatenates every worker's `local` buffer in rank order.
    fn all_gather(&self, local: &[f64]) -> Vec<f64>;
}

/// A group with a single member.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWorker;

impl Communicator for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_u64(&self, value: u64, _root: usize) -> u64 {
        value
    }

    fn all_reduce_sum(&self, _buf: &mut [f64]) {}

    fn all_gather(&self, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// One member of an in-process worker group.
///
/// Create the whole group with [`ThreadGroup::new`] and move each member to
/// its own thread.
///
/// # Example
///
/// ```rust
/// use briny_nn::comm::{Communicator, ThreadGroup};
///
/// let handles: Vec<_> = ThreadGroup::new(3)
///     .into_iter()
///     .map(|comm| {
///         std::thread::spawn(move || {
///             let mut buf = [comm.rank() as f64 + 1.0];
///             comm.all_reduce_sum(&mut buf);
///             buf[0]
///         })
///     })
///     .collect();
/// for h in handles {
///     assert_eq!(h.join().unwrap(), 6.0);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Creates the `size` members of a new group.
    pub fn new(size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size).map(|rank| Self { rank, size, shared: Arc::clone(&shared) }).collect()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Vec<f64>>> {
        self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `local` and returns every member's contribution.
    fn exchange(&self, local: Vec<f64>) -> Vec<Vec<f64>> {
        self.slots()[self.rank] = local;
        self.shared.barrier.wait();
        let all = self.slots().clone();
        // nobody may overwrite a slot before everyone has read it
        self.shared.barrier.wait();
        all
    }
}

impl Communicator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> u64 {
        // both 32-bit halves are exactly representable as f64
        let all = self.exchange(vec![(value >> 32) as f64, (value & 0xFFFF_FFFF) as f64]);
        ((all[root][0] as u64) << 32) | all[root][1] as u64
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) {
        let all = self.exchange(buf.to_vec());
        buf.fill(0.0);
        for part in &all {
            debug_assert_eq!(part.len(), buf.len(), "all-reduce length mismatch");
            buf.iter_mut().zip(part).for_each(|(a, &b)| *a += b);
        }
    }

    fn all_gather(&self, local: &[f64]) -> Vec<f64> {
        self.exchange(local.to_vec()).concat()
    }
}

/// [`Communicator::all_reduce_sum`] over any [`Real`] buffer.
pub fn all_reduce_real<T: Real>(comm: &dyn Communicator, buf: &mut [T]) {
    if comm.size() == 1 {
        return;
    }
    let mut wide: Vec<f64> = buf.iter().map(|&x| x.into_f64()).collect();
    comm.all_reduce_sum(&mut wide);
    buf.iter_mut().zip(wide).for_each(|(a, b)| *a = T::from_f64(b));
}

/// [`Communicator::all_gather`] over any [`Real`] buffer.
pub fn all_gather_real<T: Real>(comm: &dyn Communicator, local: &[T]) -> Vec<T> {
    if comm.size() == 1 {
        return local.to_vec();
    }
    let wide: Vec<f64> = local.iter().map(|&x| x.into_f64()).collect();
    comm.all_gather(&wide).into_iter().map(T::from_f64).collect()
}

/// Reassembles a stacked activation from per-worker unit slices.
///
/// Each worker passes its `(maps · count_r) × batch` block; the result is
/// the full `(maps · total) × batch` matrix with every map's units back in
/// order.
pub fn gather_units<T: Real>(
    comm: &dyn Communicator,
    local: &Matrix<T>,
    maps: usize,
    partition: &Partition,
) -> Matrix<T> {
    if comm.size() == 1 {
        return local.clone();
    }

    let batch = local.cols();
    let total = partition.total();
    let all = all_gather_real(comm, local.as_slice());
    let mut out = Matrix::zeros(maps * total, batch);

    let mut base = 0;
    for (&offset, &count) in partition.offsets().iter().zip(partition.counts()) {
        for i in 0..maps {
            for j in 0..count {
                let src = base + (i * count + j) * batch;
                out.row_mut(i * total + offset + j).copy_from_slice(&all[src..src + batch]);
            }
        }
        base += maps * count * batch;
    }
    out
}

/// Everything a layer needs to cooperate with other workers.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Group whose members split the units of every layer.
    pub inner: Arc<dyn Communicator>,
    /// Group of independent replicas, used for parameter averaging.
    pub outer: Arc<dyn Communicator>,
    /// Sink for FLOP accounting.
    pub flops: FlopCounter,
}

impl WorkerContext {
    /// Builds a context from explicit groups.
    pub fn new(inner: Arc<dyn Communicator>, outer: Arc<dyn Communicator>, flops: FlopCounter) -> Self {
        Self { inner, outer, flops }
    }

    /// A lone worker with no replicas.
    pub fn single() -> Self {
        Self::new(Arc::new(SingleWorker), Arc::new(SingleWorker), FlopCounter::new())
    }

    /// Rank within the inner group.
    pub fn rank(&self) -> usize {
        self.inner.rank()
    }

    /// This worker's slice of `total` units.
    pub fn slice(&self, total: usize) -> Range<usize> {
        partition::slice(total, self.inner.size(), self.inner.rank())
    }

    /// The partition of `total` units over the inner group.
    pub fn partition(&self, total: usize) -> Partition {
        Partition::new(total, self.inner.size())
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<R: Send + 'static>(n: usize, f: impl Fn(ThreadGroup) -> R + Send + Sync + 'static) -> Vec<R> {
        let f = Arc::new(f);
        let handles: Vec<_> = ThreadGroup::new(n)
            .into_iter()
            .map(|c| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn broadcast_takes_root_value() {
        let seen = run(4, |c| c.broadcast_u64(100 + c.rank() as u64, 2));
        assert_eq!(seen, vec![102; 4]);
    }

    #[test]
    fn broadcast_keeps_full_u64_range() {
        let seen = run(2, |c| c.broadcast_u64(if c.rank() == 0 { u64::MAX - 1 } else { 0 }, 0));
        assert_eq!(seen, vec![u64::MAX - 1; 2]);
    }

    #[test]
    fn all_gather_orders_by_rank() {
        let seen = run(3, |c| c.all_gather(&vec![c.rank() as f64; c.rank() + 1]));
        for v in seen {
            assert_eq!(v, vec![0.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn repeated_collectives_do_not_mix() {
        let seen = run(3, |c| {
            let mut total = 0.0;
            for step in 0..20 {
                let mut buf = [(c.rank() * step) as f64];
                c.all_reduce_sum(&mut buf);
                total += buf[0];
            }
            total
        });
        let expected: f64 = (0..20).map(|s| (3 * s) as f64).sum();
        assert_eq!(seen, vec![expected; 3]);
    }

    #[test]
    fn gather_units_restores_map_order() {
        // 2 maps × 5 units × 1 sample, split over 2 workers (2 + 3 units)
        let seen = run(2, |c| {
            let part = Partition::new(5, 2);
            let range = part.range(c.rank());
            let local = Matrix::from_fn(2 * range.len(), 1, |r, _| {
                let (i, j) = (r / range.len(), r % range.len());
                (i * 10 + range.start + j) as f64
            });
            gather_units(&c, &local, 2, &part)
        });
        let expected = Matrix::from_vec(10, 1, vec![0.0, 1.0, 2.0, 3.0, 4.0, 10.0, 11.0, 12.0, 13.0, 14.0]);
        for m in seen {
            assert_eq!(m, expected);
        }
    }
}

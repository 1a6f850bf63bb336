//! Splitting a unit dimension across cooperating workers.
//!
//! Worker `r` of `P` owns `[r·U/P, (r+1)·U/P)` (integer division). The
//! slices are contiguous, disjoint, ordered by rank and cover `[0, U)`
//! exactly; remainders land on the trailing ranks. Every layer computes its
//! slice through [`slice`], so forward, backward and gradient passes always
//! agree on who owns what.

use core::ops::Range;

/// The slice of `total` units owned by `rank` out of `workers`.
///
/// # Panics
/// In debug builds, if `workers == 0` or `rank >= workers`.
///
/// # Example
///
/// ```rust
/// use briny_nn::partition::slice;
///
/// assert_eq!(slice(10, 3, 0), 0..3);
/// assert_eq!(slice(10, 3, 1), 3..6);
/// assert_eq!(slice(10, 3, 2), 6..10);
/// ```
pub fn slice(total: usize, workers: usize, rank: usize) -> Range<usize> {
    debug_assert!(workers > 0 && rank < workers, "rank {rank} outside a group of {workers}");
    (rank * total / workers)..((rank + 1) * total / workers)
}

/// Slice sizes and offsets of every rank, as needed by all-gather.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    total: usize,
    offsets: Vec<usize>,
    counts: Vec<usize>,
}

impl Partition {
    /// Partitions `total` units over `workers`.
    pub fn new(total: usize, workers: usize) -> Self {
        let (offsets, counts) = (0..workers)
            .map(|r| {
                let s = slice(total, workers, r);
                (s.start, s.len())
            })
            .unzip();
        Self { total, offsets, counts }
    }

    /// Total number of units.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.counts.len()
    }

    /// The units owned by `rank`.
    pub fn range(&self, rank: usize) -> Range<usize> {
        self.offsets[rank]..self.offsets[rank] + self.counts[rank]
    }

    /// First unit of every rank.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Unit count of every rank.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_cover_exactly() {
        for total in 0..40 {
            for workers in 1..9 {
                let p = Partition::new(total, workers);
                let mut next = 0;
                for r in 0..workers {
                    let s = p.range(r);
                    assert_eq!(s.start, next, "gap before rank {r} ({total}/{workers})");
                    next = s.end;
                }
                assert_eq!(next, total);
                assert_eq!(p.counts().iter().sum::<usize>(), total);
            }
        }
    }

    #[test]
    fn remainder_goes_to_trailing_ranks() {
        let p = Partition::new(7, 3);
        assert_eq!(p.counts(), &[2, 2, 3]);
        assert_eq!(p.offsets(), &[0, 2, 4]);
    }

    #[test]
    fn single_worker_owns_everything() {
        assert_eq!(slice(17, 1, 0), 0..17);
    }
}

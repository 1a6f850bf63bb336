//! Floating point operation accounting.
//!
//! Layers add their estimated work to a [`FlopCounter`] handed to them
//! through the [`WorkerContext`](crate::comm::WorkerContext). The counter is
//! advisory: nothing reads it for control decisions, so increments use
//! relaxed ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, cheaply cloneable FLOP accumulator.
///
/// Clones observe the same count.
///
/// # Example
///
/// ```rust
/// use briny_nn::flops::FlopCounter;
///
/// let counter = FlopCounter::new();
/// let view = counter.clone();
/// counter.add(128);
/// assert_eq!(view.read(), 128);
/// assert_eq!(view.reset(), 128);
/// assert_eq!(counter.read(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlopCounter(Arc<AtomicU64>);

impl FlopCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` operations.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current count.
    pub fn read(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Resets to zero, returning the count accumulated so far.
    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

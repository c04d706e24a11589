//! Batching of signed byte deltas before they reach a tracker.

use std::cell::Cell;

/// Accumulates signed byte deltas for one execution context and decides when the accumulated
/// value is large enough to be worth committing to the external tracker.
///
/// The cache is two scalars and never allocates. It uses interior mutability without any
/// synchronization, so it is `!Sync`: only the thread currently executing the owning context
/// may touch it.
///
/// # Examples
///
/// ```
/// use alloc_meter::ConsumptionCache;
///
/// let cache = ConsumptionCache::new(100);
///
/// assert_eq!(cache.consume(60), None);
/// assert_eq!(cache.consume(50), Some(110));
/// assert_eq!(cache.pending(), 0);
/// ```
#[derive(Debug)]
pub struct ConsumptionCache {
    pending: Cell<i64>,
    threshold: u64,
}

impl ConsumptionCache {
    /// Creates an empty cache that commits once the magnitude of the pending
    /// value exceeds `threshold` bytes.
    ///
    /// A threshold of zero commits every non-zero delta immediately.
    #[must_use]
    pub const fn new(threshold: u64) -> Self {
        Self {
            pending: Cell::new(0),
            threshold,
        }
    }

    /// Adds `delta` to the pending value.
    ///
    /// If the magnitude of the pending value now exceeds the threshold, the pending value is
    /// reset to zero and returned so the caller can commit it. Otherwise returns `None`.
    #[inline]
    pub fn consume(&self, delta: i64) -> Option<i64> {
        let pending = self.pending.get().saturating_add(delta);

        if pending.unsigned_abs() > self.threshold {
            self.pending.set(0);
            Some(pending)
        } else {
            self.pending.set(pending);
            None
        }
    }

    /// Resets the pending value to zero, returning what it was.
    #[inline]
    pub fn take(&self) -> i64 {
        self.pending.replace(0)
    }

    /// The value accumulated since the last commit.
    #[must_use]
    #[inline]
    pub fn pending(&self) -> i64 {
        self.pending.get()
    }

    /// The magnitude the pending value must exceed before it is committed.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

//! A counting reference node for the memory tracker hierarchy.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicI64, AtomicU64};

use crate::MemTracker;

/// A lock-free tracker node that counts committed bytes and forwards every commit to an
/// optional parent.
///
/// This is the simplest possible hierarchical tracker. It records consumption, the peak
/// consumption and how many commits it has received. It never enforces any limit.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use alloc_meter::{CountingTracker, MemTracker};
///
/// let process = Arc::new(CountingTracker::new("process"));
/// let query = CountingTracker::with_parent("query", Arc::<CountingTracker>::clone(&process));
///
/// query.consume(4096);
/// query.consume(-1024);
///
/// assert_eq!(query.consumption(), 3072);
/// assert_eq!(process.consumption(), 3072);
/// assert_eq!(process.peak(), 4096);
/// ```
pub struct CountingTracker {
    label: String,
    parent: Option<Arc<dyn MemTracker>>,

    consumption: AtomicI64,
    peak: AtomicI64,
    commits: AtomicU64,
}

impl CountingTracker {
    /// Creates a root tracker node.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            parent: None,
            consumption: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Creates a tracker node that forwards every commit to `parent`.
    #[must_use]
    pub fn with_parent(label: impl Into<String>, parent: Arc<dyn MemTracker>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(label)
        }
    }

    /// The label given to this node when it was created.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Net bytes committed to this node so far.
    #[must_use]
    pub fn consumption(&self) -> i64 {
        self.consumption.load(atomic::Ordering::Relaxed)
    }

    /// The highest value [`consumption()`][Self::consumption] has reached.
    #[must_use]
    pub fn peak(&self) -> i64 {
        self.peak.load(atomic::Ordering::Relaxed)
    }

    /// How many times [`consume()`][MemTracker::consume] has been called on this node,
    /// including zero-valued commits.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(atomic::Ordering::Relaxed)
    }
}

impl MemTracker for CountingTracker {
    fn consume(&self, bytes: i64) {
        // Relaxed is sufficient: readers only need an eventually consistent aggregate.
        let previous = self.consumption.fetch_add(bytes, atomic::Ordering::Relaxed);
        self.peak
            .fetch_max(previous.wrapping_add(bytes), atomic::Ordering::Relaxed);
        self.commits.fetch_add(1, atomic::Ordering::Relaxed);

        if let Some(parent) = &self.parent {
            parent.consume(bytes);
        }
    }
}

impl fmt::Debug for CountingTracker {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingTracker")
            .field("label", &self.label)
            .field("has_parent", &self.parent.is_some())
            .field("consumption", &self.consumption())
            .field("peak", &self.peak())
            .field("commits", &self.commits())
            .finish()
    }
}

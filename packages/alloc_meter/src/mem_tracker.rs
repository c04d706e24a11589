//! The interface to the external memory tracker hierarchy.

use std::fmt::Debug;

/// A node in an external, hierarchical memory tracker that receives committed byte deltas.
///
/// Trackers are shared between all execution contexts that charge into them and are therefore
/// called from many threads at once. Implementations must synchronize internally.
///
/// `consume()` is usually invoked from within an allocator hook. Implementations must not
/// allocate, block or panic.
pub trait MemTracker: Debug + Send + Sync {
    /// Applies a signed byte delta to this tracker (and whatever it forwards to).
    fn consume(&self, bytes: i64);
}

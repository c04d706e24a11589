//! Process-unique identities of threads and tasks.

use std::fmt;
use std::num::NonZero;
use std::sync::atomic::{self, AtomicU64};

// Keys start at 1 and are never reused for the lifetime of the process. A resolution cache
// compares keys to detect task switches, so reuse would let a stale pointer pass validation.
static NEXT_TASK_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

// Called from the allocator hook path, so it must not panic. The counter wraps after 2^64 keys
// and the wrapped-around zero is skipped.
fn next_key(source: &AtomicU64) -> NonZero<u64> {
    loop {
        if let Some(key) = NonZero::new(source.fetch_add(1, atomic::Ordering::Relaxed)) {
            return key;
        }
    }
}

/// Process-unique identity of a cooperative task.
///
/// This is the value a task runtime publishes as the "active task identity" of a thread while
/// the task runs there. Two tasks never share a key, even if one has long completed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskKey(NonZero<u64>);

impl TaskKey {
    /// Allocates a new key that has never been handed out before.
    #[must_use]
    pub fn next() -> Self {
        Self(next_key(&NEXT_TASK_KEY))
    }

    /// The numeric value of the key, for logging and diagnostics.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Process-unique identity of an OS thread that has been seen by an allocator hook.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ThreadKey(NonZero<u64>);

impl ThreadKey {
    pub(crate) fn next() -> Self {
        Self(next_key(&NEXT_THREAD_KEY))
    }

    /// The numeric value of the key, for logging and diagnostics.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique() {
        let a = TaskKey::next();
        let b = TaskKey::next();

        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn zero_is_skipped_when_counter_wraps() {
        let source = AtomicU64::new(u64::MAX);

        assert_eq!(next_key(&source).get(), u64::MAX);
        assert_eq!(next_key(&source).get(), 1);
        assert_eq!(next_key(&source).get(), 2);
    }

    #[test]
    fn thread_and_task_keys_display_differently() {
        let task = TaskKey::next();
        let thread = ThreadKey::next();

        assert_eq!(task.to_string(), format!("task-{}", task.get()));
        assert_eq!(thread.to_string(), format!("thread-{}", thread.get()));
    }
}

//! Execution contexts: the units that memory consumption is attributed to.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{ConsumptionCache, MemTracker, TaskKey, ThreadKey};

/// Identifies the logical unit of execution an [`ExecutionContext`] accounts for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ContextId {
    /// A plain OS thread, outside of any cooperative task.
    Thread(ThreadKey),

    /// A cooperative task, wherever it currently runs.
    Task(TaskKey),
}

/// The accounting state of one thread or one task.
///
/// Each context owns a [`ConsumptionCache`] and a handle to the tracker node its consumption
/// is charged to. Deltas are batched in the cache and committed to the tracker once they
/// exceed the flush threshold. Dropping the context flushes whatever is still pending.
///
/// A context is `Send` (a task may migrate between worker threads) but not `Sync`: it must
/// only ever be mutated by the one thread currently executing it.
pub struct ExecutionContext {
    id: ContextId,
    tracker: Arc<dyn MemTracker>,
    initialized: Cell<bool>,
    cache: ConsumptionCache,
}

impl ExecutionContext {
    pub(crate) fn new(id: ContextId, tracker: Arc<dyn MemTracker>, flush_threshold: u64) -> Self {
        Self {
            id,
            tracker,
            initialized: Cell::new(false),
            cache: ConsumptionCache::new(flush_threshold),
        }
    }

    /// Identity of the thread or task this context accounts for.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The tracker node that receives this context's commits.
    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn MemTracker> {
        &self.tracker
    }

    /// Whether the owner of this context has finished setting it up.
    ///
    /// Allocator hooks skip events for contexts that are not yet initialized.
    #[must_use]
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Marks the context as ready to receive consumption from allocator hooks.
    pub fn mark_initialized(&self) {
        self.initialized.set(true);
    }

    /// Adds a signed byte delta, committing to the tracker if the pending value now
    /// exceeds the flush threshold.
    #[inline]
    pub fn cache_consume(&self, delta: i64) {
        if let Some(commit) = self.cache.consume(delta) {
            self.tracker.consume(commit);
        }
    }

    /// Commits the pending value to the tracker unconditionally (even if it is zero)
    /// and resets it. Returns the committed value.
    pub fn flush(&self) -> i64 {
        let pending = self.cache.take();
        self.tracker.consume(pending);
        pending
    }

    /// The value accumulated since the last commit.
    #[must_use]
    #[inline]
    pub fn pending(&self) -> i64 {
        self.cache.pending()
    }

    /// The magnitude the pending value must exceed before it is committed.
    #[must_use]
    pub fn flush_threshold(&self) -> u64 {
        self.cache.threshold()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for ExecutionContext {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("tracker", &self.tracker)
            .field("initialized", &self.initialized.get())
            .field("cache", &self.cache)
            .finish()
    }
}

/// A typed handle to an [`ExecutionContext`], as stored in task-local storage and in
/// worker resolution caches.
///
/// Creating a handle is safe; dereferencing one is only done by the resolver under the
/// contract of [`TaskRuntime`][crate::TaskRuntime], which guarantees that the context is
/// alive and not in use by any other thread while its task is active on the current thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContextPtr(NonNull<ExecutionContext>);

impl ContextPtr {
    /// Creates a handle pointing at `context`.
    #[must_use]
    pub fn new(context: &ExecutionContext) -> Self {
        Self(NonNull::from(context))
    }

    /// # Safety
    ///
    /// The context must be alive for `'a` and must not be accessed by any other thread
    /// during `'a`.
    pub(crate) unsafe fn as_context<'a>(self) -> &'a ExecutionContext {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { self.0.as_ref() }
    }
}

//! A ready-made task runtime backed by a thread-local "active task" slot.
//!
//! A [`TaskAccount`] marks its task as active on the current thread for the duration of
//! [`TaskAccount::in_scope()`]. [`Accounted`] does the same around every poll of a future, so
//! a future that an executor moves between worker threads is charged correctly on each of them.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tracing::trace;

use crate::{ContextId, ContextPtr, ExecutionContext, MemTracker, TaskKey, TaskRuntime};

#[derive(Clone, Copy)]
struct ActiveTask {
    key: TaskKey,
    context: ContextPtr,
}

thread_local! {
    // Read from inside allocator hooks, so it must be const and free of drop glue.
    static ACTIVE_TASK: Cell<Option<ActiveTask>> = const { Cell::new(None) };
}

fn active() -> Option<ActiveTask> {
    ACTIVE_TASK.try_with(Cell::get).ok().flatten()
}

/// The default [`TaskRuntime`]: the active task of a thread is whichever [`TaskAccount`] is
/// currently in scope on it.
#[derive(Clone, Copy, Debug, Default)]
#[expect(clippy::exhaustive_structs, reason = "intentionally an empty struct")]
pub struct ScopedTasks;

// SAFETY: The published context belongs to a TaskAccount that is borrowed by `in_scope()` on
// this very thread, so it stays alive and unshared while its key is active. Reading a const
// thread-local neither allocates, blocks nor panics.
unsafe impl TaskRuntime for ScopedTasks {
    #[inline]
    fn active_task(&self) -> Option<TaskKey> {
        active().map(|task| task.key)
    }

    #[inline]
    fn task_context(&self, key: TaskKey) -> Option<ContextPtr> {
        active()
            .filter(|task| task.key == key)
            .map(|task| task.context)
    }
}

/// The execution context of one task on the [`ScopedTasks`] runtime.
///
/// An account can move between threads but is only ever in scope on one of them at a time.
/// Dropping the account commits whatever is still pending to its tracker.
pub struct TaskAccount {
    key: TaskKey,
    context: Box<ExecutionContext>,
}

impl TaskAccount {
    pub(crate) fn open(tracker: Arc<dyn MemTracker>, flush_threshold: u64) -> Self {
        let key = TaskKey::next();
        let context = Box::new(ExecutionContext::new(
            ContextId::Task(key),
            tracker,
            flush_threshold,
        ));
        context.mark_initialized();

        trace!(task = %key, "task account opened");

        Self { key, context }
    }

    /// The key under which this task is published while in scope.
    #[must_use]
    pub fn key(&self) -> TaskKey {
        self.key
    }

    /// The tracker that receives this task's consumption.
    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn MemTracker> {
        self.context.tracker()
    }

    /// Consumption charged to the task but not yet committed to its tracker.
    #[must_use]
    pub fn pending(&self) -> i64 {
        self.context.pending()
    }

    /// Commits all pending consumption to the tracker and returns the committed amount.
    pub fn flush(&self) -> i64 {
        self.context.flush()
    }

    /// Runs `f` with this task marked as the active task of the current thread.
    ///
    /// The previously active task, if any, becomes active again when `f` returns or unwinds.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let entered = ActiveTask {
            key: self.key,
            context: ContextPtr::new(&self.context),
        };

        let previous = ACTIVE_TASK.with(|active| active.replace(Some(entered)));
        let _restore = scopeguard::guard(previous, |previous| {
            _ = ACTIVE_TASK.try_with(|active| active.set(previous));
        });

        f()
    }
}

impl fmt::Debug for TaskAccount {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskAccount")
            .field("key", &self.key)
            .field("context", &self.context)
            .finish()
    }
}

impl Drop for TaskAccount {
    fn drop(&mut self) {
        trace!(task = %self.key, pending = self.context.pending(), "task account closed");
    }
}

pin_project! {
    /// A future whose allocations are charged to its own [`TaskAccount`], on whichever thread
    /// it is polled.
    ///
    /// Dropping the future also drops the wrapped future inside the account's scope, so the
    /// memory it still holds is released against the task that allocated it.
    ///
    /// Created by [`AccountingService::accounted()`][crate::AccountingService::accounted].
    pub struct Accounted<F> {
        account: TaskAccount,
        #[pin]
        inner: Option<F>,
    }

    impl<F> PinnedDrop for Accounted<F> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            let mut inner = this.inner;
            this.account.in_scope(|| inner.set(None));
        }
    }
}

impl<F> Accounted<F> {
    pub(crate) fn new(account: TaskAccount, inner: F) -> Self {
        Self {
            account,
            inner: Some(inner),
        }
    }

    /// The account that this future is charged to.
    #[must_use]
    pub fn account(&self) -> &TaskAccount {
        &self.account
    }
}

impl<F: Future> Future for Accounted<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let inner = this
            .inner
            .as_pin_mut()
            .expect("the wrapped future is only cleared when the Accounted is dropped");

        this.account.in_scope(|| inner.poll(cx))
    }
}

impl<F> fmt::Debug for Accounted<F> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accounted")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

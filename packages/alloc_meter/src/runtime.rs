//! The contract between the resolver and a cooperative task runtime.

use std::fmt::Debug;

use crate::{ContextPtr, TaskKey};

/// Exposes which cooperative task (if any) is active on the calling thread and where that
/// task's [`ExecutionContext`][crate::ExecutionContext] lives.
///
/// The resolver calls both methods from inside allocator hooks, on every allocation and
/// deallocation of a thread that is running a task.
///
/// # Safety
///
/// Implementations must uphold all of the following:
///
/// * Neither method may allocate, block, yield or panic.
/// * `active_task()` must return the key of the task currently executing on the calling thread,
///   updated on every task switch, and `None` when the thread is not executing a task.
/// * While `active_task()` returns `Some(key)` on a thread, a `ContextPtr` returned by
///   `task_context(key)` must point to a live `ExecutionContext` that no other thread accesses.
/// * Once `task_context(key)` has returned a `ContextPtr`, the context must stay at that
///   address for as long as the task exists. Resolved pointers are cached per key.
/// * A key must never be reused for a different task.
pub unsafe trait TaskRuntime: Debug + Send + Sync + 'static {
    /// The identity of the task executing on the calling thread, if any.
    fn active_task(&self) -> Option<TaskKey>;

    /// Looks up the execution context stored in the task-local storage of the task with
    /// the given key. Returns `None` if the task has no context.
    fn task_context(&self, key: TaskKey) -> Option<ContextPtr>;
}

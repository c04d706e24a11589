use std::alloc::GlobalAlloc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64, AtomicUsize};

use crate::{
    Accounted, Allocator, BindError, Charge, ContextId, ExecutionContext, HookAdapter, HookGuard,
    MemTracker, RegisterError, Resolver, ServiceBuilder, SkipReason, TaskAccount, TaskKey,
    UsableSize, WorkerBinding, thread_context,
};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(0);

/// Distinguishes the thread contexts of different services that share one thread.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ServiceId(u64);

impl ServiceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SERVICE_ID.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

/// Counters that describe how allocator events have been resolved so far.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct HookStats {
    /// Task context lookups made against the task runtime, i.e. resolution cache misses.
    pub lookups: u64,

    /// Events that were not charged to any context.
    pub skipped: u64,
}

/// Attributes heap consumption to the execution context that caused it.
///
/// Every allocator event is charged to the active task of the calling thread if there is one,
/// otherwise to the calling thread itself. Charges accumulate in a per-context consumption
/// cache and reach the context's [`MemTracker`] in batches.
///
/// A service is meant to live for the whole process, so it is typically placed in a `static`
/// or leaked, then registered once at startup with [`register()`][Self::register].
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, LazyLock};
///
/// use alloc_meter::{AccountingService, CountingTracker};
///
/// static SERVICE: LazyLock<AccountingService> = LazyLock::new(AccountingService::new);
///
/// let tracker = Arc::new(CountingTracker::new("request"));
/// let account = SERVICE.task_account(Arc::<CountingTracker>::clone(&tracker));
///
/// // Direct charges bypass the allocator; registered hooks do exactly this.
/// account.in_scope(|| SERVICE.charge(4096));
///
/// assert_eq!(account.pending(), 4096);
/// ```
#[derive(Debug)]
pub struct AccountingService {
    id: ServiceId,
    resolver: Resolver,
    registrations: AtomicUsize,
    skipped: AtomicU64,
}

impl AccountingService {
    /// Creates a service with default settings.
    ///
    /// Use [`AccountingService::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the service.
    #[must_use]
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    pub(crate) fn from_resolver(id: ServiceId, resolver: Resolver) -> Self {
        Self {
            id,
            resolver,
            registrations: AtomicUsize::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Installs this service's allocator hooks into `allocator`.
    ///
    /// Call this once, early during process startup. Registering twice installs the hooks
    /// twice, after which every event is charged twice.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::HookTableFull`] if the allocator has no free hook slot. The
    /// service is not operational in that case, which callers should treat as fatal.
    pub fn register<A>(
        &'static self,
        allocator: &'static Allocator<A>,
    ) -> Result<(), RegisterError>
    where
        A: GlobalAlloc + UsableSize + Sync,
    {
        // The hook table keeps the adapter for the rest of the process.
        let adapter: &'static HookAdapter<'static> = Box::leak(Box::new(HookAdapter::new(
            allocator as &(dyn UsableSize + Sync),
            self,
        )));

        adapter.register(allocator)
    }

    /// Charges `delta` bytes to the execution context running on the calling thread.
    ///
    /// This is the operation the allocator hooks perform for every event. It never allocates
    /// while deciding where the delta goes.
    pub fn charge(&self, delta: i64) -> Charge {
        let Some(guard) = HookGuard::enter() else {
            self.count_skip();
            return Charge::Skipped(SkipReason::Reentrant);
        };

        let charge = self.resolver.charge(delta);
        drop(guard);

        match charge {
            Charge::Parked => {
                thread_context::materialize(
                    self.id,
                    self.resolver.thread_tracker(),
                    self.resolver.flush_threshold(),
                );
            }
            Charge::Skipped(_) => self.count_skip(),
            Charge::Task(_) | Charge::Thread => {}
        }

        charge
    }

    fn count_skip(&self) {
        self.skipped.fetch_add(1, atomic::Ordering::Relaxed);
    }

    pub(crate) fn note_registration(&self) -> usize {
        self.registrations.fetch_add(1, atomic::Ordering::Relaxed)
    }

    /// Claims one worker resolution cache slot for the current thread.
    ///
    /// Worker threads of a task runtime should hold a binding for as long as they run tasks.
    /// Threads without a binding still resolve correctly, through a thread-local cache that
    /// holds one entry for all services on the thread.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::NoFreeSlot`] if every slot is held by some thread and
    /// [`BindError::ThreadAlreadyBound`] if the current thread already holds a slot.
    pub fn bind_worker(&self) -> Result<WorkerBinding<'_>, BindError> {
        self.resolver.bind_worker()
    }

    /// Creates a task execution context that commits to `tracker`.
    ///
    /// The context uses the flush threshold of this service, whichever service its events
    /// are later charged through.
    ///
    /// The context starts out uninitialized: events resolved to it are skipped until its
    /// owner calls [`ExecutionContext::mark_initialized()`]. Custom task runtimes store the
    /// returned box in their task-local storage and hand out [`ContextPtr`][crate::ContextPtr]s
    /// to it.
    #[must_use]
    pub fn new_task_context(
        &self,
        key: TaskKey,
        tracker: Arc<dyn MemTracker>,
    ) -> Box<ExecutionContext> {
        Box::new(ExecutionContext::new(
            ContextId::Task(key),
            tracker,
            self.resolver.flush_threshold(),
        ))
    }

    /// Opens an account for a task that runs on the built-in [`ScopedTasks`] runtime.
    #[must_use]
    pub fn task_account(&self, tracker: Arc<dyn MemTracker>) -> TaskAccount {
        TaskAccount::open(tracker, self.resolver.flush_threshold())
    }

    /// Wraps `future` so that everything it allocates is charged to a new account for
    /// `tracker`, on whichever thread it is polled.
    pub fn accounted<F: Future>(&self, tracker: Arc<dyn MemTracker>, future: F) -> Accounted<F> {
        Accounted::new(self.task_account(tracker), future)
    }

    /// Creates the current thread's execution context now instead of on the first event.
    ///
    /// Returns `false` if the context already existed or the thread is shutting down.
    pub fn attach_current_thread(&self) -> bool {
        thread_context::materialize(
            self.id,
            self.resolver.thread_tracker(),
            self.resolver.flush_threshold(),
        )
    }

    /// Commits whatever the current thread's context has pending to the thread tracker.
    ///
    /// Returns the committed amount, or `None` if this service has no context on this thread.
    pub fn flush_current_thread(&self) -> Option<i64> {
        let _guard = HookGuard::enter()?;
        thread_context::flush(self.id)
    }

    /// The uncommitted consumption of the current thread's context.
    #[must_use]
    pub fn current_thread_pending(&self) -> Option<i64> {
        thread_context::pending(self.id)
    }

    /// Resolution counters accumulated since the service was created.
    #[must_use]
    pub fn stats(&self) -> HookStats {
        HookStats {
            lookups: self.resolver.lookups(),
            skipped: self.skipped.load(atomic::Ordering::Relaxed),
        }
    }

    /// The tracker that receives the consumption of plain threads.
    #[must_use]
    pub fn thread_tracker(&self) -> &Arc<dyn MemTracker> {
        self.resolver.thread_tracker()
    }

    /// The flush threshold given to every context this service creates.
    #[must_use]
    pub fn flush_threshold(&self) -> u64 {
        self.resolver.flush_threshold()
    }

    /// The number of worker resolution cache slots.
    #[must_use]
    pub fn worker_slots(&self) -> usize {
        self.resolver.worker_slots()
    }
}

impl Default for AccountingService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{ContextPtr, CountingTracker, TaskRuntime};

    assert_impl_all!(AccountingService: Send, Sync);

    fn counting(label: &str) -> (Arc<CountingTracker>, Arc<dyn MemTracker>) {
        let tracker = Arc::new(CountingTracker::new(label));
        let handle: Arc<dyn MemTracker> = Arc::<CountingTracker>::clone(&tracker);
        (tracker, handle)
    }

    #[test]
    fn thread_charges_reach_thread_tracker() {
        testing::on_fresh_thread(|| {
            let (threads, handle) = counting("threads");
            let service = AccountingService::builder()
                .thread_tracker(handle)
                .flush_threshold(100)
                .build();

            // The first event creates the thread context and carries the delta over.
            assert_eq!(service.charge(60), Charge::Parked);
            assert_eq!(service.current_thread_pending(), Some(60));

            assert_eq!(service.charge(60), Charge::Thread);
            assert_eq!(threads.consumption(), 120);
            assert_eq!(service.current_thread_pending(), Some(0));

            assert_eq!(service.charge(-20), Charge::Thread);
            assert_eq!(service.flush_current_thread(), Some(-20));
            assert_eq!(threads.consumption(), 100);
        });
    }

    #[test]
    fn thread_context_is_flushed_at_exit() {
        let (threads, handle) = counting("threads");
        let service = AccountingService::builder().thread_tracker(handle).build();

        // An explicit join waits for the thread-local destructors, an implicit one does not.
        thread::scope(|s| {
            s.spawn(|| {
                assert!(service.attach_current_thread());
                assert!(!service.attach_current_thread());
                assert_eq!(service.charge(512), Charge::Thread);
            })
            .join()
            .unwrap();
        });

        assert_eq!(threads.consumption(), 512);
    }

    #[test]
    fn task_takes_precedence_over_thread() {
        testing::on_fresh_thread(|| {
            let (threads, thread_handle) = counting("threads");
            let (task, task_handle) = counting("task");
            let service = AccountingService::builder()
                .thread_tracker(thread_handle)
                .flush_threshold(0)
                .build();
            service.attach_current_thread();

            let account = service.task_account(task_handle);
            let charge = account.in_scope(|| service.charge(64));

            assert_eq!(charge, Charge::Task(account.key()));
            assert_eq!(task.consumption(), 64);
            assert_eq!(threads.consumption(), 0);
        });
    }

    #[test]
    fn uninitialized_task_context_is_skipped() {
        #[derive(Debug)]
        struct Fixed(TaskKey, ContextPtr);

        // SAFETY: Test runtime; the context outlives every use within the test body.
        unsafe impl TaskRuntime for Fixed {
            fn active_task(&self) -> Option<TaskKey> {
                Some(self.0)
            }

            fn task_context(&self, key: TaskKey) -> Option<ContextPtr> {
                (key == self.0).then_some(self.1)
            }
        }

        // SAFETY: The raw pointer is only dereferenced on the test thread.
        unsafe impl Send for Fixed {}
        // SAFETY: See above.
        unsafe impl Sync for Fixed {}

        let (task, handle) = counting("task");
        let key = TaskKey::next();

        // The runtime needs the context before the service exists, so the context comes from
        // a separate service with the same threshold.
        let context = AccountingService::builder()
            .flush_threshold(0)
            .build()
            .new_task_context(key, handle);
        assert_eq!(context.flush_threshold(), 0);

        let service = AccountingService::builder()
            .runtime(Fixed(key, ContextPtr::new(&context)))
            .flush_threshold(0)
            .build();

        assert_eq!(
            service.charge(8),
            Charge::Skipped(SkipReason::ContextUninitialized)
        );
        assert_eq!(service.stats().skipped, 1);
        assert_eq!(task.consumption(), 0);

        context.mark_initialized();
        assert_eq!(service.charge(8), Charge::Task(key));
        assert_eq!(task.consumption(), 8);
        assert_eq!(context.pending(), 0);

        drop(service);
    }

    #[test]
    fn reentrant_charge_is_skipped_and_counted() {
        let service = AccountingService::new();

        let guard = HookGuard::enter().unwrap();
        assert_eq!(service.charge(8), Charge::Skipped(SkipReason::Reentrant));
        drop(guard);

        assert_eq!(service.stats().skipped, 1);
    }

    #[test]
    fn foreign_thread_context_is_skipped() {
        testing::on_fresh_thread(|| {
            let first = AccountingService::new();
            let second = AccountingService::new();

            first.attach_current_thread();

            assert_eq!(
                second.charge(8),
                Charge::Skipped(SkipReason::ForeignThreadContext)
            );
            assert_eq!(second.current_thread_pending(), None);
            assert_eq!(second.flush_current_thread(), None);
        });
    }

    #[test]
    fn flush_without_context_is_none() {
        testing::on_fresh_thread(|| {
            let service = AccountingService::new();
            assert_eq!(service.flush_current_thread(), None);
            assert_eq!(service.current_thread_pending(), None);
        });
    }
}

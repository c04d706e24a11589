//! Resolution of "who is running right now" for each allocator event.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU64};

use tracing::debug;

use crate::{
    BindError, ContextPtr, MemTracker, ServiceId, TaskKey, TaskRuntime, ThreadCharge,
    thread_context,
};

/// Why an allocator event was not charged to any execution context.
///
/// Skipped events are bounded accounting drift, never an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SkipReason {
    /// The event was raised while hook logic was already executing on this thread.
    Reentrant,

    /// A task is active but task-local storage holds no context for it.
    TaskContextAbsent,

    /// The resolved context has not been marked as initialized by its owner.
    ContextUninitialized,

    /// The thread's context was created by a different accounting service.
    ForeignThreadContext,

    /// The thread is tearing down its thread-local storage.
    ThreadExiting,
}

/// Where a byte delta ended up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Charge {
    /// Charged to the context of the task with this key.
    Task(TaskKey),

    /// Charged to the calling thread's own context.
    Thread,

    /// Held for the calling thread's context, which is created right after.
    Parked,

    /// Not charged anywhere.
    Skipped(SkipReason),
}

impl Charge {
    fn from_thread(charge: ThreadCharge) -> Self {
        match charge {
            ThreadCharge::Applied => Self::Thread,
            ThreadCharge::Parked => Self::Parked,
            ThreadCharge::Skipped(reason) => Self::Skipped(reason),
        }
    }
}

/// Per-worker cache of the last resolved task context.
///
/// The cached pointer is only trusted while the thread's active task key equals the cached
/// key. Keys are never reused, so a matching key proves the pointer is still current.
pub(crate) struct WorkerSlot {
    bound: AtomicBool,
    key: Cell<Option<TaskKey>>,
    context: Cell<Option<ContextPtr>>,
}

// SAFETY: The cells are only touched by the one thread that holds the binding for this slot.
// Exclusive ownership is handed over through the `bound` flag with acquire/release ordering.
unsafe impl Sync for WorkerSlot {}
// SAFETY: See above; the slot holds no thread-affine state outside of a binding.
unsafe impl Send for WorkerSlot {}

impl WorkerSlot {
    const fn new() -> Self {
        Self {
            bound: AtomicBool::new(false),
            key: Cell::new(None),
            context: Cell::new(None),
        }
    }

    fn clear(&self) {
        self.key.set(None);
        self.context.set(None);
    }
}

impl fmt::Debug for WorkerSlot {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The cells belong to whichever thread is bound, so only the flag is shown.
        f.debug_struct("WorkerSlot")
            .field("bound", &self.bound.load(atomic::Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
struct BoundWorker {
    owner: ServiceId,
    slot: NonNull<WorkerSlot>,
}

/// The last task context resolved on a thread that holds no worker binding.
#[derive(Clone, Copy)]
struct UnboundEntry {
    owner: ServiceId,
    key: TaskKey,
    context: ContextPtr,
}

thread_local! {
    static BOUND_WORKER: Cell<Option<BoundWorker>> = const { Cell::new(None) };
    static UNBOUND_CACHE: Cell<Option<UnboundEntry>> = const { Cell::new(None) };
}

/// Decides which execution context receives each allocator event.
#[derive(Debug)]
pub(crate) struct Resolver {
    owner: ServiceId,
    runtime: Box<dyn TaskRuntime>,
    workers: Box<[WorkerSlot]>,
    thread_tracker: Arc<dyn MemTracker>,
    flush_threshold: u64,
    lookups: AtomicU64,
}

impl Resolver {
    pub(crate) fn new(
        owner: ServiceId,
        runtime: Box<dyn TaskRuntime>,
        worker_slots: usize,
        thread_tracker: Arc<dyn MemTracker>,
        flush_threshold: u64,
    ) -> Self {
        Self {
            owner,
            runtime,
            workers: (0..worker_slots).map(|_| WorkerSlot::new()).collect(),
            thread_tracker,
            flush_threshold,
            lookups: AtomicU64::new(0),
        }
    }

    pub(crate) fn thread_tracker(&self) -> &Arc<dyn MemTracker> {
        &self.thread_tracker
    }

    pub(crate) fn flush_threshold(&self) -> u64 {
        self.flush_threshold
    }

    pub(crate) fn worker_slots(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn lookups(&self) -> u64 {
        self.lookups.load(atomic::Ordering::Relaxed)
    }

    /// Charges `delta` to the context that is executing on the calling thread.
    /// Must be called with a [`HookGuard`][crate::HookGuard] held.
    #[inline]
    pub(crate) fn charge(&self, delta: i64) -> Charge {
        match self.runtime.active_task() {
            Some(key) => self.charge_task(key, delta),
            None => Charge::from_thread(thread_context::charge(self.owner, delta)),
        }
    }

    #[inline]
    fn charge_task(&self, key: TaskKey, delta: i64) -> Charge {
        let Some(ptr) = self.resolve_task(key) else {
            return Charge::Skipped(SkipReason::TaskContextAbsent);
        };

        // SAFETY: `key` is active on this thread, so the TaskRuntime contract guarantees the
        // context is alive and not accessed by any other thread for the duration of this call.
        let context = unsafe { ptr.as_context() };

        if !context.is_initialized() {
            return Charge::Skipped(SkipReason::ContextUninitialized);
        }

        context.cache_consume(delta);
        Charge::Task(key)
    }

    /// Returns the context of the active task, revalidating the worker cache first.
    #[inline]
    fn resolve_task(&self, key: TaskKey) -> Option<ContextPtr> {
        let Some(slot) = self.bound_slot() else {
            return self.resolve_unbound(key);
        };

        if slot.key.get() == Some(key) {
            if let Some(cached) = slot.context.get() {
                return Some(cached);
            }
        }

        // A different task is active than the one cached: either a switch happened on this
        // worker or a task migrated in. The cache is overwritten before the pointer is used.
        let fresh = self.lookup(key);
        slot.key.set(fresh.map(|_| key));
        slot.context.set(fresh);
        fresh
    }

    /// Resolution for threads without a worker binding of this resolver, through a
    /// thread-local one-entry cache that is shared by all resolvers on the thread.
    fn resolve_unbound(&self, key: TaskKey) -> Option<ContextPtr> {
        let cached = UNBOUND_CACHE
            .try_with(Cell::get)
            .ok()
            .flatten()
            .filter(|entry| entry.owner == self.owner && entry.key == key);

        if let Some(entry) = cached {
            return Some(entry.context);
        }

        let fresh = self.lookup(key);

        if let Some(context) = fresh {
            _ = UNBOUND_CACHE.try_with(|cache| {
                cache.set(Some(UnboundEntry {
                    owner: self.owner,
                    key,
                    context,
                }));
            });
        }

        fresh
    }

    /// Only reached on a resolution cache miss, so the shared counter stays off the hot path.
    fn lookup(&self, key: TaskKey) -> Option<ContextPtr> {
        self.lookups.fetch_add(1, atomic::Ordering::Relaxed);
        self.runtime.task_context(key)
    }

    fn bound_slot(&self) -> Option<&WorkerSlot> {
        let bound = BOUND_WORKER.try_with(Cell::get).ok().flatten()?;

        if bound.owner != self.owner {
            return None;
        }

        // SAFETY: The pointer was set by a WorkerBinding of this resolver, which borrows the
        // resolver and clears the thread-local before it goes away, so the slot is alive.
        Some(unsafe { bound.slot.as_ref() })
    }

    pub(crate) fn bind_worker(&self) -> Result<WorkerBinding<'_>, BindError> {
        let already_bound = BOUND_WORKER.with(Cell::get).is_some();
        if already_bound {
            return Err(BindError::ThreadAlreadyBound);
        }

        let claimed = self.workers.iter().enumerate().find(|(_, slot)| {
            // Acquire on failure is unnecessary: we do not touch a slot we failed to claim.
            slot.bound
                .compare_exchange(false, true, atomic::Ordering::AcqRel, atomic::Ordering::Relaxed)
                .is_ok()
        });

        let Some((index, slot)) = claimed else {
            return Err(BindError::NoFreeSlot {
                capacity: self.workers.len(),
            });
        };

        slot.clear();
        BOUND_WORKER.with(|bound| {
            bound.set(Some(BoundWorker {
                owner: self.owner,
                slot: NonNull::from(slot),
            }));
        });

        debug!(worker_slot = index, "worker thread bound");

        Ok(WorkerBinding {
            slot,
            index,
            _single_threaded: PhantomData,
        })
    }
}

/// Binds the current thread to one worker resolution cache slot of an accounting service.
///
/// Obtained from [`AccountingService::bind_worker()`][crate::AccountingService::bind_worker].
/// Dropping the binding clears the cached resolution and frees the slot for another thread.
#[derive(Debug)]
#[must_use = "the worker slot is released when the binding is dropped"]
pub struct WorkerBinding<'a> {
    slot: &'a WorkerSlot,
    index: usize,

    _single_threaded: PhantomData<*const ()>,
}

impl WorkerBinding<'_> {
    /// The index of the worker slot held by this binding.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.index
    }
}

impl Drop for WorkerBinding<'_> {
    fn drop(&mut self) {
        self.slot.clear();
        _ = BOUND_WORKER.try_with(|bound| bound.set(None));
        self.slot.bound.store(false, atomic::Ordering::Release);

        debug!(worker_slot = self.index, "worker thread unbound");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{CountingTracker, HookGuard, ScopedTasks, TaskAccount};

    assert_not_impl_any!(WorkerBinding<'static>: Send, Sync);

    fn resolver(worker_slots: usize) -> Resolver {
        Resolver::new(
            ServiceId::next(),
            Box::new(ScopedTasks),
            worker_slots,
            Arc::new(CountingTracker::new("threads")),
            u64::MAX,
        )
    }

    fn open_account(resolver: &Resolver) -> (TaskAccount, Arc<CountingTracker>) {
        let tracker = Arc::new(CountingTracker::new("task"));
        let account = TaskAccount::open(Arc::<CountingTracker>::clone(&tracker), resolver.flush_threshold());
        (account, tracker)
    }

    fn charge(resolver: &Resolver, delta: i64) -> Charge {
        let _guard = HookGuard::enter().unwrap();
        resolver.charge(delta)
    }

    #[test]
    fn no_active_task_resolves_to_thread() {
        let resolver = resolver(1);

        thread::scope(|s| {
            s.spawn(|| {
                // The thread context does not exist yet, so the first delta is parked.
                assert_eq!(charge(&resolver, 8), Charge::Parked);
            });
        });

        assert_eq!(resolver.lookups(), 0);
    }

    #[test]
    fn active_task_takes_precedence_over_thread() {
        let resolver = resolver(1);
        let (account, _tracker) = open_account(&resolver);

        account.in_scope(|| {
            assert_eq!(charge(&resolver, 64), Charge::Task(account.key()));
        });

        assert_eq!(account.pending(), 64);
    }

    #[test]
    fn bound_worker_looks_up_once_per_switch() {
        let resolver = &resolver(1);
        let (first, _) = open_account(resolver);
        let (second, _) = open_account(resolver);

        let (first, second) = thread::scope(|s| {
            s.spawn(move || {
                let _binding = resolver.bind_worker().unwrap();

                first.in_scope(|| {
                    for _ in 0..10 {
                        charge(resolver, 16);
                    }
                });
                assert_eq!(resolver.lookups(), 1);

                second.in_scope(|| {
                    charge(resolver, 16);
                    charge(resolver, 16);
                });
                assert_eq!(resolver.lookups(), 2);

                first.in_scope(|| {
                    charge(resolver, 16);
                });
                assert_eq!(resolver.lookups(), 3);

                (first, second)
            })
            .join()
            .unwrap()
        });

        assert_eq!(first.pending(), 11 * 16);
        assert_eq!(second.pending(), 2 * 16);
    }

    #[test]
    fn unbound_thread_looks_up_once_per_switch() {
        let resolver = resolver(1);
        let (first, _) = open_account(&resolver);
        let (second, _) = open_account(&resolver);

        first.in_scope(|| {
            for _ in 0..5 {
                charge(&resolver, 1);
            }
        });
        assert_eq!(resolver.lookups(), 1);

        second.in_scope(|| {
            charge(&resolver, 1);
            charge(&resolver, 1);
        });
        assert_eq!(resolver.lookups(), 2);

        first.in_scope(|| charge(&resolver, 1));
        assert_eq!(resolver.lookups(), 3);

        assert_eq!(first.pending(), 6);
        assert_eq!(second.pending(), 2);
    }

    #[test]
    fn unbound_cache_is_not_shared_between_resolvers() {
        let one = resolver(1);
        let other = resolver(1);
        let (account, _) = open_account(&one);

        account.in_scope(|| {
            charge(&one, 1);
            charge(&other, 1);
            charge(&one, 1);
        });

        assert_eq!(one.lookups(), 2);
        assert_eq!(other.lookups(), 1);
        assert_eq!(account.pending(), 3);
    }

    #[test]
    fn migrated_task_is_refetched_on_new_worker() {
        let resolver = &resolver(2);
        let (migrant, migrant_tracker) = open_account(resolver);
        let (resident, _) = open_account(resolver);

        // The task starts on worker 1 and is cached there.
        let migrant = thread::scope(|s| {
            s.spawn(move || {
                let _binding = resolver.bind_worker().unwrap();
                migrant.in_scope(|| charge(resolver, 64));
                migrant
            })
            .join()
            .unwrap()
        });

        // Worker 2 has a different task cached when the migrant resumes there.
        let (migrant, resident) = thread::scope(|s| {
            s.spawn(move || {
                let _binding = resolver.bind_worker().unwrap();
                resident.in_scope(|| charge(resolver, 1000));
                migrant.in_scope(|| charge(resolver, 32));
                (migrant, resident)
            })
            .join()
            .unwrap()
        });

        assert_eq!(migrant.pending(), 96);
        assert_eq!(resident.pending(), 1000);

        assert_eq!(migrant.flush(), 96);
        assert_eq!(migrant_tracker.consumption(), 96);
    }

    #[test]
    fn binding_twice_on_same_thread_fails() {
        let resolver = resolver(2);

        thread::scope(|s| {
            s.spawn(|| {
                let _binding = resolver.bind_worker().unwrap();
                assert!(matches!(
                    resolver.bind_worker(),
                    Err(BindError::ThreadAlreadyBound)
                ));
            });
        });
    }

    #[test]
    fn slots_are_exhausted_then_reusable() {
        let resolver = resolver(1);

        thread::scope(|s| {
            s.spawn(|| {
                let binding = resolver.bind_worker().unwrap();
                assert_eq!(binding.slot_index(), 0);

                thread::scope(|inner| {
                    inner.spawn(|| {
                        assert!(matches!(
                            resolver.bind_worker(),
                            Err(BindError::NoFreeSlot { capacity: 1 })
                        ));
                    });
                });

                drop(binding);

                thread::scope(|inner| {
                    inner.spawn(|| {
                        let rebound = resolver.bind_worker().unwrap();
                        assert_eq!(rebound.slot_index(), 0);
                    });
                });
            });
        });
    }

    #[test]
    fn binding_of_other_resolver_is_ignored() {
        let bound_to = &resolver(1);
        let other = &resolver(1);
        let (account, _) = open_account(other);

        thread::scope(|s| {
            s.spawn(move || {
                let _binding = bound_to.bind_worker().unwrap();

                account.in_scope(|| {
                    charge(other, 1);
                    charge(other, 1);
                });
            });
        });

        // `other` has no binding on that thread, so it falls back to the unbound cache.
        assert_eq!(other.lookups(), 1);
        assert_eq!(bound_to.lookups(), 0);
    }
}

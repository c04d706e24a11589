//! Execution contexts of plain OS threads, kept in thread-local storage.
//!
//! Registering a thread-local destructor can itself allocate, so the context cannot be created
//! inside the guarded hook section. Instead the first events on a thread are parked in an
//! allocation-free carry-over cell and the context is materialized right after the guarded
//! section ends. Events raised while materializing are parked as well and applied once the
//! context is ready.

use std::cell::{Cell, OnceCell};
use std::sync::Arc;

use crate::{
    ContextId, ExecutionContext, HookGuard, MemTracker, ServiceId, SkipReason, ThreadKey,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Unmaterialized,
    Materializing,
    Ready,
    Exited,
}

/// Deltas held for a thread context that one service is about to create.
#[derive(Clone, Copy, Debug)]
struct CarryOver {
    owner: ServiceId,
    delta: i64,
}

#[derive(Debug)]
struct ThreadSlot {
    owner: ServiceId,
    context: ExecutionContext,
}

thread_local! {
    static LIFECYCLE: Cell<Lifecycle> = const { Cell::new(Lifecycle::Unmaterialized) };
    static CARRY_OVER: Cell<Option<CarryOver>> = const { Cell::new(None) };

    // Dropped by the thread-local destructor at thread exit, which flushes the context.
    static CONTEXT: OnceCell<ThreadSlot> = const { OnceCell::new() };
}

/// What happened to a delta offered to the current thread's context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ThreadCharge {
    Applied,
    Parked,
    Skipped(SkipReason),
}

fn lifecycle() -> Lifecycle {
    LIFECYCLE.try_with(Cell::get).unwrap_or(Lifecycle::Exited)
}

fn set_lifecycle(value: Lifecycle) {
    _ = LIFECYCLE.try_with(|lifecycle| lifecycle.set(value));
}

/// Charges `delta` to the current thread's context. Must be called with a [`HookGuard`] held.
#[inline]
pub(crate) fn charge(owner: ServiceId, delta: i64) -> ThreadCharge {
    match lifecycle() {
        Lifecycle::Ready => with_owned_context(owner, |context| {
            if context.is_initialized() {
                context.cache_consume(delta);
                ThreadCharge::Applied
            } else {
                ThreadCharge::Skipped(SkipReason::ContextUninitialized)
            }
        })
        .unwrap_or_else(ThreadCharge::Skipped),
        Lifecycle::Unmaterialized | Lifecycle::Materializing => park(owner, delta),
        Lifecycle::Exited => ThreadCharge::Skipped(SkipReason::ThreadExiting),
    }
}

/// Holds `delta` for the context that `owner` is about to create. Deltas of any other service
/// are skipped, as that service will not own the thread's context.
fn park(owner: ServiceId, delta: i64) -> ThreadCharge {
    CARRY_OVER
        .try_with(|carry| match carry.get() {
            Some(parked) if parked.owner != owner => {
                ThreadCharge::Skipped(SkipReason::ForeignThreadContext)
            }
            parked => {
                let held = parked.map_or(0, |parked| parked.delta);
                carry.set(Some(CarryOver {
                    owner,
                    delta: held.saturating_add(delta),
                }));
                ThreadCharge::Parked
            }
        })
        .unwrap_or(ThreadCharge::Skipped(SkipReason::ThreadExiting))
}

/// Creates the current thread's context if it does not exist yet and applies any parked
/// deltas to it. Must be called without a [`HookGuard`] held, as this may allocate.
///
/// Returns whether this call created the context.
pub(crate) fn materialize(
    owner: ServiceId,
    tracker: &Arc<dyn MemTracker>,
    threshold: u64,
) -> bool {
    if lifecycle() != Lifecycle::Unmaterialized {
        return false;
    }

    set_lifecycle(Lifecycle::Materializing);

    // From here on only `owner` may park deltas. Whatever another service parked is dropped.
    _ = CARRY_OVER.try_with(|carry| {
        let held = carry
            .get()
            .filter(|parked| parked.owner == owner)
            .map_or(0, |parked| parked.delta);
        carry.set(Some(CarryOver { owner, delta: held }));
    });

    // The first access registers the thread-local destructor, which may allocate. Those
    // nested events see the Materializing state and are parked.
    let created = CONTEXT.try_with(|cell| {
        let slot = cell.get_or_init(|| ThreadSlot {
            owner,
            context: ExecutionContext::new(
                ContextId::Thread(ThreadKey::next()),
                Arc::clone(tracker),
                threshold,
            ),
        });
        slot.context.mark_initialized();
    });

    if created.is_err() {
        // The thread is already tearing down its thread-local storage.
        set_lifecycle(Lifecycle::Exited);
        return false;
    }

    set_lifecycle(Lifecycle::Ready);

    let carried = CARRY_OVER
        .try_with(Cell::take)
        .ok()
        .flatten()
        .filter(|parked| parked.owner == owner)
        .map_or(0, |parked| parked.delta);

    if carried != 0 {
        if let Some(_guard) = HookGuard::enter() {
            _ = with_owned_context(owner, |context| context.cache_consume(carried));
        }
    }

    true
}

fn with_owned_context<R>(
    owner: ServiceId,
    f: impl FnOnce(&ExecutionContext) -> R,
) -> Result<R, SkipReason> {
    CONTEXT
        .try_with(|cell| match cell.get() {
            Some(slot) if slot.owner == owner => Ok(f(&slot.context)),
            Some(_) => Err(SkipReason::ForeignThreadContext),
            None => Err(SkipReason::ThreadExiting),
        })
        .unwrap_or(Err(SkipReason::ThreadExiting))
}

/// The pending value of the current thread's context, if it exists and belongs to `owner`.
pub(crate) fn pending(owner: ServiceId) -> Option<i64> {
    if lifecycle() != Lifecycle::Ready {
        return None;
    }

    with_owned_context(owner, ExecutionContext::pending).ok()
}

/// Flushes the current thread's context, if it exists and belongs to `owner`.
pub(crate) fn flush(owner: ServiceId) -> Option<i64> {
    if lifecycle() != Lifecycle::Ready {
        return None;
    }

    with_owned_context(owner, ExecutionContext::flush).ok()
}

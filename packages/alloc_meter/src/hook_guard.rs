//! Re-entrancy protection for the hook path.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    // Const-initialized and without drop glue, so touching it never allocates and never
    // registers a thread-local destructor. This is what makes it safe to use from inside the
    // allocator call path.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as executing hook logic for as long as it is alive.
///
/// Only one guard can exist per thread at a time. Any allocator event raised while a guard
/// exists (for example by a tracker that allocates) fails to obtain its own guard and is
/// skipped instead of recursing into the hook.
#[derive(Debug)]
pub(crate) struct HookGuard {
    _single_threaded: PhantomData<*const ()>,
}

impl HookGuard {
    #[inline]
    pub(crate) fn enter() -> Option<Self> {
        let already_inside = IN_HOOK.try_with(|flag| flag.replace(true)).unwrap_or(true);

        if already_inside {
            None
        } else {
            Some(Self {
                _single_threaded: PhantomData,
            })
        }
    }
}

impl Drop for HookGuard {
    #[inline]
    fn drop(&mut self) {
        _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

/// Whether the current thread is executing allocator hook logic right now.
///
/// Allocator test doubles can assert that they are never entered while this returns `true`,
/// which proves that the hook path itself performs no heap operations.
#[must_use]
#[inline]
pub fn in_hook() -> bool {
    IN_HOOK.try_with(Cell::get).unwrap_or(false)
}

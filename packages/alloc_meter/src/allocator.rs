//! Allocator wrapper that offers post-allocate and pre-free hooks.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{self, AtomicUsize};

use crate::error::Result;
use crate::{AllocatorHooks, RegisterError, UsableSize};

/// How many hook pairs can be installed into one [`Allocator`].
pub const MAX_HOOKS: usize = 4;

/// Fixed-capacity table of installed hooks. Reading it never allocates or locks.
struct HookTable {
    slots: [OnceLock<&'static dyn AllocatorHooks>; MAX_HOOKS],
    claimed: AtomicUsize,
}

impl HookTable {
    const fn new() -> Self {
        Self {
            slots: [const { OnceLock::new() }; MAX_HOOKS],
            claimed: AtomicUsize::new(0),
        }
    }

    fn install(&self, hooks: &'static dyn AllocatorHooks) -> Result<usize> {
        let index = self
            .claimed
            .fetch_update(atomic::Ordering::AcqRel, atomic::Ordering::Acquire, |claimed| {
                claimed.checked_add(1).filter(|&next| next <= MAX_HOOKS)
            })
            .map_err(|_claimed| RegisterError::HookTableFull)?;

        let slot = self
            .slots
            .get(index)
            .expect("index was bounds-checked when the slot was claimed");

        slot.set(hooks)
            .map_err(|_hooks| ())
            .expect("slot was claimed exclusively so it cannot already be set");

        Ok(index)
    }

    #[inline]
    fn installed(&self) -> usize {
        self.claimed.load(atomic::Ordering::Relaxed)
    }

    #[inline]
    fn post_alloc(&self, ptr: *mut u8, layout: Layout) {
        if self.installed() == 0 {
            return;
        }

        for hooks in self.slots.iter().filter_map(OnceLock::get) {
            // SAFETY: Forwarding the guarantees of the allocator that owns this table.
            unsafe {
                hooks.post_alloc(ptr, layout);
            }
        }
    }

    #[inline]
    fn pre_free(&self, ptr: *mut u8, layout: Layout) {
        if self.installed() == 0 {
            return;
        }

        for hooks in self.slots.iter().filter_map(OnceLock::get) {
            // SAFETY: Forwarding the guarantees of the allocator that owns this table.
            unsafe {
                hooks.pre_free(ptr, layout);
            }
        }
    }
}

/// A memory allocator that invokes installed [`AllocatorHooks`] around every allocation and
/// deallocation made through it.
///
/// Install it as the global allocator to observe every heap operation of the process.
/// Until a hook is installed, the wrapper only adds one relaxed atomic load per call.
///
/// # Examples
///
/// ```rust
/// use alloc_meter::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
    hooks: HookTable,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .field("installed_hooks", &self.hooks.installed())
            .finish()
    }
}

impl Allocator<System> {
    /// Creates a hookable allocator on top of the system's default allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a hookable allocator on top of `allocator`.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self {
            inner: allocator,
            hooks: HookTable::new(),
        }
    }

    /// Installs a pair of hooks into the next free slot of the hook table.
    ///
    /// Installation is permanent. Installing the same hooks twice makes them run twice per
    /// event.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::HookTableFull`] if [`MAX_HOOKS`] hooks are already installed.
    pub fn install(&self, hooks: &'static dyn AllocatorHooks) -> Result<()> {
        self.hooks.install(hooks).map(|_index| ())
    }

    /// How many hook pairs have been installed.
    #[must_use]
    pub fn installed_hooks(&self) -> usize {
        self.hooks.installed()
    }
}

impl<A: GlobalAlloc + UsableSize> UsableSize for Allocator<A> {
    #[inline]
    unsafe fn usable_size(&self, ptr: NonNull<u8>, layout: Layout) -> usize {
        // SAFETY: Forwarding the guarantees of the caller; the block came from `inner`.
        unsafe { self.inner.usable_size(ptr, layout) }
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator, which already
// implements GlobalAlloc safely. Hooks only observe the blocks, they never touch them.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc(layout) };

        if !ptr.is_null() {
            self.hooks.post_alloc(ptr, layout);
        }

        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.hooks.pre_free(ptr, layout);

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };

        if !ptr.is_null() {
            self.hooks.post_alloc(ptr, layout);
        }

        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // The usable size of the old block can only be queried while it is still live.
        self.hooks.pre_free(ptr, layout);

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

        if new_ptr.is_null() {
            // The old block is untouched on failure, so it is charged back.
            self.hooks.post_alloc(ptr, layout);
        } else {
            // SAFETY: The realloc contract guarantees `new_size` is valid for this alignment.
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            self.hooks.post_alloc(new_ptr, new_layout);
        }

        new_ptr
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static_assertions::assert_impl_all!(Allocator<System>: Send, Sync);

    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    enum Event {
        Alloc(usize),
        Free(usize),
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingHooks {
        fn leaked() -> &'static Self {
            Box::leak(Box::default())
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    // The allocator under test is never the global allocator, so recording into a Vec is fine.
    impl AllocatorHooks for RecordingHooks {
        unsafe fn post_alloc(&self, _ptr: *mut u8, layout: Layout) {
            self.events.lock().unwrap().push(Event::Alloc(layout.size()));
        }

        unsafe fn pre_free(&self, _ptr: *mut u8, layout: Layout) {
            self.events.lock().unwrap().push(Event::Free(layout.size()));
        }
    }

    /// Fails every realloc, leaving the original block untouched.
    struct FailingRealloc;

    // SAFETY: Delegates to System except for realloc, which reports failure without side effects.
    unsafe impl GlobalAlloc for FailingRealloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            // SAFETY: Forwarding to System.
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            // SAFETY: Forwarding to System.
            unsafe { System.dealloc(ptr, layout) }
        }

        unsafe fn realloc(&self, _ptr: *mut u8, _layout: Layout, _new_size: usize) -> *mut u8 {
            std::ptr::null_mut()
        }
    }

    #[test]
    fn no_hooks_installed_initially() {
        let allocator = Allocator::system();
        assert_eq!(allocator.installed_hooks(), 0);
    }

    #[test]
    fn alloc_and_dealloc_invoke_hooks_in_order() {
        let allocator = Allocator::system();
        let hooks = RecordingHooks::leaked();
        allocator.install(hooks).unwrap();

        let layout = Layout::from_size_align(100, 8).unwrap();

        // SAFETY: Layout is non-zero-sized; the block is freed with the same layout.
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, layout);
        }

        assert_eq!(hooks.events(), vec![Event::Alloc(100), Event::Free(100)]);
    }

    #[test]
    fn alloc_zeroed_invokes_post_alloc() {
        let allocator = Allocator::system();
        let hooks = RecordingHooks::leaked();
        allocator.install(hooks).unwrap();

        let layout = Layout::from_size_align(32, 8).unwrap();

        // SAFETY: Layout is non-zero-sized; the block is freed with the same layout.
        unsafe {
            let ptr = allocator.alloc_zeroed(layout);
            assert_eq!(*ptr, 0);
            allocator.dealloc(ptr, layout);
        }

        assert_eq!(hooks.events(), vec![Event::Alloc(32), Event::Free(32)]);
    }

    #[test]
    fn realloc_frees_old_and_allocates_new() {
        let allocator = Allocator::system();
        let hooks = RecordingHooks::leaked();
        allocator.install(hooks).unwrap();

        let layout = Layout::from_size_align(16, 8).unwrap();

        // SAFETY: Layouts are non-zero-sized; the final block is freed with its current layout.
        unsafe {
            let ptr = allocator.alloc(layout);
            let grown = allocator.realloc(ptr, layout, 64);
            assert!(!grown.is_null());
            allocator.dealloc(grown, Layout::from_size_align(64, 8).unwrap());
        }

        assert_eq!(
            hooks.events(),
            vec![
                Event::Alloc(16),
                Event::Free(16),
                Event::Alloc(64),
                Event::Free(64)
            ]
        );
    }

    #[test]
    fn failed_realloc_charges_old_block_back() {
        let allocator = Allocator::new(FailingRealloc);
        let hooks = RecordingHooks::leaked();
        allocator.install(hooks).unwrap();

        let layout = Layout::from_size_align(16, 8).unwrap();

        // SAFETY: Layout is non-zero-sized; the original block survives the failed realloc
        // and is freed with its original layout.
        unsafe {
            let ptr = allocator.alloc(layout);
            let grown = allocator.realloc(ptr, layout, 64);
            assert!(grown.is_null());
            allocator.dealloc(ptr, layout);
        }

        assert_eq!(
            hooks.events(),
            vec![
                Event::Alloc(16),
                Event::Free(16),
                Event::Alloc(16),
                Event::Free(16)
            ]
        );
    }

    #[test]
    fn every_installed_hook_runs() {
        let allocator = Allocator::system();
        let first = RecordingHooks::leaked();
        let second = RecordingHooks::leaked();
        allocator.install(first).unwrap();
        allocator.install(second).unwrap();

        let layout = Layout::from_size_align(8, 8).unwrap();

        // SAFETY: Layout is non-zero-sized; the block is freed with the same layout.
        unsafe {
            let ptr = allocator.alloc(layout);
            allocator.dealloc(ptr, layout);
        }

        assert_eq!(first.events().len(), 2);
        assert_eq!(second.events().len(), 2);
    }

    #[test]
    fn table_rejects_hooks_beyond_capacity() {
        let allocator = Allocator::system();

        for _ in 0..MAX_HOOKS {
            allocator.install(RecordingHooks::leaked()).unwrap();
        }

        let result = allocator.install(RecordingHooks::leaked());

        assert!(matches!(result, Err(RegisterError::HookTableFull)));
        assert_eq!(allocator.installed_hooks(), MAX_HOOKS);
    }
}

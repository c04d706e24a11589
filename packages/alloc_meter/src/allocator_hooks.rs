use std::alloc::Layout;

/// Callbacks invoked by [`Allocator`][crate::Allocator] around every allocation and
/// deallocation.
///
/// Both callbacks run synchronously on the allocating thread, inside the allocator's own call
/// path. They may be called while arbitrary locks are held, so implementations must not
/// allocate, block or panic.
pub trait AllocatorHooks: Sync {
    /// Called immediately after the inner allocator returned `ptr` for `layout`.
    ///
    /// # Safety
    ///
    /// `ptr` is either null or a live block allocated by the allocator that invokes
    /// this hook, for `layout`.
    unsafe fn post_alloc(&self, ptr: *mut u8, layout: Layout);

    /// Called immediately before `ptr` is returned to the inner allocator.
    ///
    /// # Safety
    ///
    /// `ptr` is either null or a live block allocated by the allocator that invokes
    /// this hook, for `layout`.
    unsafe fn pre_free(&self, ptr: *mut u8, layout: Layout);
}

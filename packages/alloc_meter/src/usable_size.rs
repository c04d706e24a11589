//! Queries for the number of bytes an allocator actually reserved for a block.

use std::alloc::{Layout, System};
use std::ptr::NonNull;

/// An allocator that can report the usable size of a block it handed out.
///
/// Allocators round requests up to size classes, so the usable size can exceed the requested
/// size. The usable size is what the block really costs and is what gets charged.
///
/// Implementations are called from inside allocator hooks and must not allocate, block
/// or panic.
pub trait UsableSize {
    /// Returns the usable size of the block at `ptr`.
    ///
    /// Allocators that cannot answer return `layout.size()`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block allocated by this allocator for `layout`.
    unsafe fn usable_size(&self, ptr: NonNull<u8>, layout: Layout) -> usize;
}

impl UsableSize for System {
    #[inline]
    unsafe fn usable_size(&self, ptr: NonNull<u8>, layout: Layout) -> usize {
        // SAFETY: Forwarding the guarantees of the caller; System hands out malloc-family blocks.
        unsafe { system_usable_size(ptr, layout) }
    }
}

#[cfg(all(target_os = "linux", not(miri)))]
#[inline]
unsafe fn system_usable_size(ptr: NonNull<u8>, _layout: Layout) -> usize {
    // SAFETY: The block is live and was allocated by the malloc family, which is all
    // that malloc_usable_size() requires.
    unsafe { libc::malloc_usable_size(ptr.as_ptr().cast()) }
}

#[cfg(all(target_vendor = "apple", not(miri)))]
#[inline]
unsafe fn system_usable_size(ptr: NonNull<u8>, _layout: Layout) -> usize {
    // SAFETY: The block is live and was allocated by the malloc family, which is all
    // that malloc_size() requires.
    unsafe { libc::malloc_size(ptr.as_ptr().cast_const().cast()) }
}

#[cfg(any(miri, not(any(target_os = "linux", target_vendor = "apple"))))]
#[inline]
unsafe fn system_usable_size(_ptr: NonNull<u8>, layout: Layout) -> usize {
    layout.size()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::GlobalAlloc;

    use super::*;

    #[test]
    fn system_usable_size_covers_request() {
        for size in [1_usize, 7, 24, 100, 1000, 4096, 70_000] {
            let layout = Layout::from_size_align(size, 8).unwrap();

            // SAFETY: Layout is non-zero-sized; the block is freed with the same layout.
            unsafe {
                let ptr = NonNull::new(System.alloc(layout)).unwrap();
                let usable = System.usable_size(ptr, layout);
                System.dealloc(ptr.as_ptr(), layout);

                assert!(usable >= size, "usable {usable} < requested {size}");
            }
        }
    }

    #[test]
    fn system_usable_size_handles_large_alignment() {
        let layout = Layout::from_size_align(48, 256).unwrap();

        // SAFETY: Layout is non-zero-sized; the block is freed with the same layout.
        unsafe {
            let ptr = NonNull::new(System.alloc(layout)).unwrap();
            let usable = System.usable_size(ptr, layout);
            System.dealloc(ptr.as_ptr(), layout);

            assert!(usable >= 48);
        }
    }
}

//! Bridges native allocator callbacks into consumption charges.

use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use tracing::{error, info, warn};

use crate::{AccountingService, Allocator, AllocatorHooks, RegisterError, UsableSize};

/// Translates allocator events into signed byte deltas charged through an
/// [`AccountingService`].
///
/// Every event is sized by the block's usable size, never the requested size, so an
/// allocate/free pair of the same block always nets to zero.
pub struct HookAdapter<'a> {
    sizer: &'a (dyn UsableSize + Sync),
    service: &'a AccountingService,
}

impl<'a> HookAdapter<'a> {
    /// Creates an adapter that sizes blocks with `sizer` and charges them to `service`.
    ///
    /// `sizer` must be the allocator whose events the adapter receives.
    #[must_use]
    pub fn new(sizer: &'a (dyn UsableSize + Sync), service: &'a AccountingService) -> Self {
        Self { sizer, service }
    }

    /// Charges `+usable_size` of a block that was just allocated.
    ///
    /// A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must be a live block allocated by the sizing allocator for `layout`.
    #[inline]
    pub unsafe fn on_allocate(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        // SAFETY: Forwarding the guarantees of the caller.
        let usable = unsafe { self.sizer.usable_size(ptr, layout) };
        _ = self.service.charge(to_delta(usable));
    }

    /// Charges `-usable_size` of a block that is about to be freed.
    ///
    /// A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must be a live block allocated by the sizing allocator for `layout`.
    #[inline]
    pub unsafe fn on_free(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        // SAFETY: Forwarding the guarantees of the caller.
        let usable = unsafe { self.sizer.usable_size(ptr, layout) };
        _ = self.service.charge(to_delta(usable).saturating_neg());
    }
}

impl HookAdapter<'static> {
    /// Installs this adapter's callbacks into `allocator`.
    ///
    /// Not idempotent: every call installs another copy of the callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::HookTableFull`] if the allocator has no free hook slot.
    pub fn register<A: GlobalAlloc>(
        &'static self,
        allocator: &'static Allocator<A>,
    ) -> Result<(), RegisterError> {
        let previous = self.service.note_registration();

        if previous > 0 {
            warn!(
                registrations = previous + 1,
                "allocator hooks registered more than once; every event will be charged repeatedly"
            );
        }

        match allocator.install(self) {
            Ok(()) => {
                info!(
                    installed_hooks = allocator.installed_hooks(),
                    flush_threshold = self.service.flush_threshold(),
                    "allocator hooks registered"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to register allocator hooks");
                Err(e)
            }
        }
    }
}

#[inline]
fn to_delta(usable: usize) -> i64 {
    i64::try_from(usable).unwrap_or(i64::MAX)
}

impl AllocatorHooks for HookAdapter<'_> {
    #[inline]
    unsafe fn post_alloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: The allocator only reports live blocks it has allocated for `layout`.
        unsafe { self.on_allocate(ptr, layout) }
    }

    #[inline]
    unsafe fn pre_free(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: The allocator reports blocks before returning them, so they are still live.
        unsafe { self.on_free(ptr, layout) }
    }
}

impl fmt::Debug for HookAdapter<'_> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookAdapter")
            .field("service", self.service)
            .finish_non_exhaustive()
    }
}

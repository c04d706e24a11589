use thiserror::Error;

use crate::MAX_HOOKS;

/// Errors that can occur when installing allocator hooks.
///
/// A registration failure means memory accounting cannot work at all, so callers are expected
/// to treat it as fatal during process startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegisterError {
    /// Every slot in the allocator hook table is already occupied.
    #[error("allocator hook table is full: all {MAX_HOOKS} slots are occupied")]
    HookTableFull,
}

/// Errors that can occur when binding a worker thread to a resolution cache slot.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BindError {
    /// All worker slots configured for the service are bound to other threads.
    #[error("all {capacity} worker slots are already bound")]
    NoFreeSlot {
        /// How many worker slots the service was configured with.
        capacity: usize,
    },

    /// The current thread already holds a worker binding.
    #[error("the current thread is already bound as a worker")]
    ThreadAlreadyBound,
}

/// A specialized `Result` type for hook registration, returning [`RegisterError`]
/// as the error value.
pub(crate) type Result<T> = std::result::Result<T, RegisterError>;

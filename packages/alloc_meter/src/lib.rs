#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Attributes every heap allocation of a process to the thread or task that made it.
//!
//! The global allocator is wrapped in an [`Allocator`] that reports each allocated and freed
//! block to an [`AccountingService`]. The service decides which execution context is running
//! on the calling thread (the active cooperative task if there is one, otherwise the thread
//! itself) and charges the block's usable size to that context. Each context batches charges
//! in a [`ConsumptionCache`] and commits them to its [`MemTracker`] once they exceed the
//! flush threshold.
//!
//! The core pieces are:
//! - [`Allocator`] - A global allocator wrapper with post-allocate and pre-free hooks
//! - [`AccountingService`] - Resolves the execution context of each event and charges it
//! - [`HookAdapter`] - Turns allocator callbacks into signed byte deltas
//! - [`TaskRuntime`] - The contract a cooperative task runtime fulfils to get per-task charges
//! - [`TaskAccount`] and [`Accounted`] - The built-in task runtime, for closures and futures
//!
//! # Usage
//!
//! ```
//! use std::sync::{Arc, LazyLock};
//!
//! use alloc_meter::{AccountingService, Allocator, CountingTracker};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! static SERVICE: LazyLock<AccountingService> = LazyLock::new(AccountingService::new);
//!
//! fn main() {
//!     SERVICE
//!         .register(&ALLOCATOR)
//!         .expect("allocator hooks must be installed at startup");
//!
//!     let query = Arc::new(CountingTracker::new("query"));
//!     let account = SERVICE.task_account(Arc::<CountingTracker>::clone(&query));
//!
//!     let rows = account.in_scope(|| vec![0_u8; 4096]);
//!     assert!(account.pending() >= 4096);
//!
//!     // Closing the account commits what it still has pending.
//!     drop(account);
//!     assert!(query.consumption() >= 4096);
//!
//!     drop(rows);
//! }
//! ```
//!
//! # Task migration
//!
//! Work-stealing executors move tasks between worker threads. Worker threads that hold a
//! [`WorkerBinding`] keep a one-entry cache of the last resolved task context, validated by
//! comparing [`TaskKey`]s on every event. Keys are never reused, so a task that migrates to a
//! worker whose cache holds a different key is always looked up again before it is charged.
//!
//! # Skipped events
//!
//! Events that cannot be attributed (raised from inside hook logic, during thread teardown,
//! or for a task whose context is absent or not yet initialized) are skipped and counted in
//! [`HookStats`]. This is bounded accounting drift, never an error.
//!
//! # Miri compatibility
//!
//! Under Miri the usable size of a block is reported as its requested size.

mod accounting_service;
mod allocator;
mod allocator_hooks;
mod consumption_cache;
mod counting_tracker;
mod error;
mod execution_context;
mod hook_adapter;
mod hook_guard;
mod keys;
mod mem_tracker;
mod resolver;
mod runtime;
mod scoped;
mod service_builder;
mod thread_context;
mod usable_size;

pub use accounting_service::{AccountingService, HookStats};
pub(crate) use accounting_service::ServiceId;
pub use allocator::{Allocator, MAX_HOOKS};
pub use allocator_hooks::AllocatorHooks;
pub use consumption_cache::ConsumptionCache;
pub use counting_tracker::CountingTracker;
pub use error::{BindError, RegisterError};
pub use execution_context::{ContextId, ContextPtr, ExecutionContext};
pub use hook_adapter::HookAdapter;
pub use hook_guard::in_hook;
pub(crate) use hook_guard::HookGuard;
pub use keys::{TaskKey, ThreadKey};
pub use mem_tracker::MemTracker;
pub(crate) use resolver::Resolver;
pub use resolver::{Charge, SkipReason, WorkerBinding};
pub use runtime::TaskRuntime;
pub use scoped::{Accounted, ScopedTasks, TaskAccount};
pub use service_builder::{DEFAULT_FLUSH_THRESHOLD, DEFAULT_WORKER_SLOTS, ServiceBuilder};
pub(crate) use thread_context::ThreadCharge;
pub use usable_size::UsableSize;

use std::sync::Arc;

use tracing::debug;

use crate::{
    AccountingService, CountingTracker, MemTracker, Resolver, ScopedTasks, ServiceId, TaskRuntime,
};

/// Default absolute pending value above which an execution context commits to its tracker.
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 1024 * 1024;

/// Default number of worker resolution cache slots of a service.
pub const DEFAULT_WORKER_SLOTS: usize = 64;

/// Builder for configuring an [`AccountingService`].
#[derive(Debug)]
pub struct ServiceBuilder {
    flush_threshold: u64,
    worker_slots: usize,
    thread_tracker: Option<Arc<dyn MemTracker>>,
    runtime: Option<Box<dyn TaskRuntime>>,
}

impl ServiceBuilder {
    pub(crate) fn new() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            worker_slots: DEFAULT_WORKER_SLOTS,
            thread_tracker: None,
            runtime: None,
        }
    }

    /// Sets the absolute pending value above which a context commits to its tracker.
    ///
    /// Zero commits on every event. Default is [`DEFAULT_FLUSH_THRESHOLD`].
    #[must_use]
    pub fn flush_threshold(mut self, bytes: u64) -> Self {
        self.flush_threshold = bytes;
        self
    }

    /// Sets the number of worker resolution cache slots.
    ///
    /// Default is [`DEFAULT_WORKER_SLOTS`].
    #[must_use]
    pub fn worker_slots(mut self, count: usize) -> Self {
        self.worker_slots = count;
        self
    }

    /// Sets the tracker that receives the consumption of plain threads.
    ///
    /// Default is a fresh [`CountingTracker`] labeled `threads`.
    #[must_use]
    pub fn thread_tracker(mut self, tracker: Arc<dyn MemTracker>) -> Self {
        self.thread_tracker = Some(tracker);
        self
    }

    /// Sets the task runtime that reports the active task of each thread.
    ///
    /// Default is [`ScopedTasks`].
    #[must_use]
    pub fn runtime(mut self, runtime: impl TaskRuntime) -> Self {
        self.runtime = Some(Box::new(runtime));
        self
    }

    /// Builds the service with the configured settings.
    #[must_use]
    pub fn build(self) -> AccountingService {
        let id = ServiceId::next();

        let thread_tracker = self
            .thread_tracker
            .unwrap_or_else(|| Arc::new(CountingTracker::new("threads")));
        let runtime = self.runtime.unwrap_or_else(|| Box::new(ScopedTasks));

        debug!(
            service = ?id,
            flush_threshold = self.flush_threshold,
            worker_slots = self.worker_slots,
            ?runtime,
            "accounting service created"
        );

        AccountingService::from_resolver(
            id,
            Resolver::new(
                id,
                runtime,
                self.worker_slots,
                thread_tracker,
                self.flush_threshold,
            ),
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{BindError, HookStats};

    assert_impl_all!(ServiceBuilder: Send);

    #[test]
    fn defaults() {
        let service = AccountingService::builder().build();

        assert_eq!(service.flush_threshold(), DEFAULT_FLUSH_THRESHOLD);
        assert_eq!(service.worker_slots(), DEFAULT_WORKER_SLOTS);
        assert_eq!(service.stats(), HookStats::default());
    }

    #[test]
    fn applies_settings() {
        let threads = Arc::new(CountingTracker::new("custom"));
        let service = AccountingService::builder()
            .flush_threshold(10)
            .worker_slots(3)
            .thread_tracker(Arc::<CountingTracker>::clone(&threads))
            .runtime(ScopedTasks)
            .build();

        assert_eq!(service.flush_threshold(), 10);
        assert_eq!(service.worker_slots(), 3);

        service.thread_tracker().consume(5);
        assert_eq!(threads.consumption(), 5);
    }

    #[test]
    fn zero_worker_slots_disables_caching() {
        let service = AccountingService::builder().worker_slots(0).build();

        assert!(matches!(
            service.bind_worker(),
            Err(BindError::NoFreeSlot { capacity: 0 })
        ));
    }
}

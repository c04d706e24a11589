#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and demos of the allocation accounting packages.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Smallest block a size-class allocator double hands out.
pub const MIN_SIZE_CLASS: usize = 16;

/// Runs a test on a helper thread and aborts it with a panic if it hangs.
///
/// The timeout is 10 seconds, or 60 seconds under Miri. Setting `MUTATION_TESTING=1` runs
/// the test directly so that mutation testing can observe hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout or if the test itself panics.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let sum = with_watchdog(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If the receiver is gone, the watchdog has already fired.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {}-second timeout", timeout.as_secs());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Runs `f` on a newly spawned thread and waits until that thread has fully exited.
///
/// The thread starts with pristine thread-local state, and all of its thread-local destructors
/// have run by the time this returns. Panics inside `f` are propagated to the caller.
pub fn on_fresh_thread<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    thread::scope(|s| match s.spawn(f).join() {
        Ok(result) => result,
        Err(e) => std::panic::resume_unwind(e),
    })
}

/// The block size a simple size-class allocator reserves for a request of `size` bytes:
/// the next power of two, but at least [`MIN_SIZE_CLASS`].
#[must_use]
pub fn round_to_size_class(size: usize) -> usize {
    size.max(MIN_SIZE_CLASS)
        .checked_next_power_of_two()
        .unwrap_or(usize::MAX)
}

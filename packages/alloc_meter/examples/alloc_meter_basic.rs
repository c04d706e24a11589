//! Attributes the memory of a few "queries" to per-query trackers under a process root.
//!
//! Two worker threads take query accounts from a shared queue. A query that is resumed by
//! the other worker keeps being charged to its own tracker, whichever thread runs it.
//!
//! Run with: `cargo run --example alloc_meter_basic`

use std::hint::black_box;
use std::sync::mpsc;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;

use alloc_meter::{AccountingService, Allocator, CountingTracker, TaskAccount};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

static PROCESS: LazyLock<Arc<CountingTracker>> =
    LazyLock::new(|| Arc::new(CountingTracker::new("process")));

static SERVICE: LazyLock<AccountingService> = LazyLock::new(|| {
    AccountingService::builder()
        .thread_tracker(Arc::new(CountingTracker::with_parent("threads", Arc::<CountingTracker>::clone(&*PROCESS))))
        .flush_threshold(64 * 1024)
        .worker_slots(2)
        .build()
});

const QUERY_COUNT: usize = 4;

fn run_step(account: &TaskAccount, step: usize, kept: &mut Vec<Vec<u8>>) {
    account.in_scope(|| {
        let size = step
            .checked_add(1)
            .and_then(|steps| steps.checked_mul(10_000))
            .expect("step counts are small");
        kept.push(black_box(vec![7_u8; size]));
    });
}

fn main() {
    let service: &'static AccountingService = &SERVICE;
    service
        .register(&ALLOCATOR)
        .expect("allocator hooks must be installed at startup");

    let queries: Vec<Arc<CountingTracker>> = (0..QUERY_COUNT)
        .map(|i| {
            Arc::new(CountingTracker::with_parent(format!("query-{i}"), Arc::<CountingTracker>::clone(&*PROCESS)))
        })
        .collect();

    // `None` tells a worker to stop.
    let (tx, rx) = mpsc::channel::<Option<(TaskAccount, usize, Vec<Vec<u8>>)>>();
    let rx = Arc::new(Mutex::new(rx));
    let (done_tx, done_rx) = mpsc::channel();

    for tracker in &queries {
        let account = service.task_account(Arc::<CountingTracker>::clone(tracker));
        tx.send(Some((account, 0, Vec::new())))
            .expect("receiver is alive");
    }

    let workers: Vec<_> = (0..2)
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            let done_tx = done_tx.clone();

            thread::spawn(move || {
                let _binding = service.bind_worker().expect("two slots for two workers");

                loop {
                    let next = rx.lock().expect("queue lock is never poisoned").recv();
                    let Ok(Some((account, step, mut kept))) = next else {
                        break;
                    };

                    run_step(&account, step, &mut kept);
                    println!("worker {worker} ran step {step} of {}", account.key());

                    // Requeue so that the next step may land on the other worker.
                    if step < 2 {
                        tx.send(Some((account, step.saturating_add(1), kept)))
                            .expect("queue is open while queries are pending");
                    } else {
                        done_tx.send((account, kept)).expect("main thread is waiting");
                    }
                }
            })
        })
        .collect();

    drop(done_tx);

    let finished: Vec<_> = done_rx.iter().take(QUERY_COUNT).collect();

    for _ in &workers {
        tx.send(None).expect("workers are alive until told to stop");
    }

    for (account, kept) in finished {
        let key = account.key();
        account.flush();
        println!("{key} holds {} vectors, committed to its tracker", kept.len());
        account.in_scope(move || drop(kept));
    }

    for worker in workers {
        worker.join().expect("worker threads do not panic");
    }

    for tracker in &queries {
        println!(
            "{}: consumption {} bytes, peak {} bytes, {} commits",
            tracker.label(),
            tracker.consumption(),
            tracker.peak(),
            tracker.commits()
        );
    }

    _ = service.flush_current_thread();
    let stats = service.stats();
    println!(
        "process: consumption {} bytes, peak {} bytes; {} lookups, {} skipped events",
        PROCESS.consumption(),
        PROCESS.peak(),
        stats.lookups,
        stats.skipped
    );
}

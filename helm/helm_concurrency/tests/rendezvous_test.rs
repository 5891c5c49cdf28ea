//! Integration tests for the rendezvous lock against a live primary loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use helm_concurrency::{
    FaultSink, InterruptFlag, PrimaryExecutor, PrimaryLoop, PrimaryLoopConfig, RendezvousLock,
};
use helm_core::error::{ConcurrencyError, Error};

fn fast_loop() -> Arc<PrimaryLoop> {
    let config = PrimaryLoopConfig {
        tick_interval: Duration::from_millis(1),
        ..Default::default()
    };
    PrimaryLoop::spawn(config, Arc::new(FaultSink::new())).unwrap()
}

/// Re-queues itself every tick and records whether it ever ran while a
/// worker was inside a critical section.
fn watch_section(
    primary_loop: Arc<PrimaryLoop>,
    in_section: Arc<AtomicBool>,
    violations: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
) {
    if in_section.load(Ordering::SeqCst) {
        violations.fetch_add(1, Ordering::SeqCst);
    }
    runs.fetch_add(1, Ordering::SeqCst);

    let next = primary_loop.clone();
    let _ = primary_loop.execute(Box::new(move || watch_section(next, in_section, violations, runs)));
}

#[test]
fn test_workers_exclude_primary_loop_and_each_other() {
    let primary_loop = fast_loop();
    let lock = RendezvousLock::new(primary_loop.clone());

    let in_section = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));
    let watcher_runs = Arc::new(AtomicUsize::new(0));
    {
        let (l, s, v, r) = (
            primary_loop.clone(),
            in_section.clone(),
            violations.clone(),
            watcher_runs.clone(),
        );
        primary_loop
            .execute(Box::new(move || watch_section(l, s, v, r)))
            .unwrap();
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            let counter = counter.clone();
            let in_section = in_section.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let guard = lock.acquire().unwrap();
                    in_section.store(true, Ordering::SeqCst);

                    // a non-atomic read-modify-write; only exclusion keeps it exact
                    let value = counter.load(Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                    counter.store(value + 1, Ordering::SeqCst);

                    in_section.store(false, Ordering::SeqCst);
                    guard.release();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 80);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(watcher_runs.load(Ordering::SeqCst) > 0);

    primary_loop.stop();
}

#[test]
fn test_primary_thread_acquires_without_submitting() {
    let primary_loop = fast_loop();
    let lock = RendezvousLock::new(primary_loop.clone());
    let (tx, rx) = crossbeam_channel::bounded(1);

    let inner = primary_loop.clone();
    primary_loop
        .execute(Box::new(move || {
            let before = inner.pending();
            let guard = lock.acquire().unwrap();
            let _ = tx.send((guard.is_obtained(), inner.pending() == before));
        }))
        .unwrap();

    let (obtained, nothing_queued) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(obtained);
    assert!(nothing_queued);

    primary_loop.stop();
}

#[test]
fn test_guard_drop_resumes_loop() {
    let primary_loop = fast_loop();
    let lock = RendezvousLock::new(primary_loop.clone());

    {
        let _guard = lock.acquire().unwrap();
        let ticks = primary_loop.tick_count();
        thread::sleep(Duration::from_millis(20));
        // parked: no tick can complete while the guard is held
        assert_eq!(primary_loop.tick_count(), ticks);
    }

    let ticks = primary_loop.tick_count();
    thread::sleep(Duration::from_millis(50));
    assert!(primary_loop.tick_count() > ticks);

    primary_loop.stop();
}

#[test]
fn test_interrupted_waiter_leaves_loop_running() {
    let primary_loop = fast_loop();
    let lock = RendezvousLock::new(primary_loop.clone());

    // hold the loop so the second acquirer has to wait
    let guard = lock.acquire().unwrap();

    let flag = InterruptFlag::new();
    let waiter = {
        let lock = lock.clone();
        let flag = flag.clone();
        thread::spawn(move || {
            let result = lock.acquire_interruptible(&flag);
            matches!(result, Err(Error::Concurrency(ConcurrencyError::Interrupted)))
        })
    };

    thread::sleep(Duration::from_millis(20));
    flag.interrupt();
    assert!(waiter.join().unwrap());
    assert!(flag.is_interrupted());

    guard.release();

    // the abandoned request runs without parking the loop
    let ticks = primary_loop.tick_count();
    thread::sleep(Duration::from_millis(50));
    assert!(primary_loop.tick_count() > ticks);

    primary_loop.stop();
}

#[test]
fn test_stopped_loop_refuses_rendezvous() {
    let primary_loop = fast_loop();
    let lock = RendezvousLock::new(primary_loop.clone());
    primary_loop.stop();

    assert!(matches!(
        lock.acquire(),
        Err(Error::Concurrency(ConcurrencyError::ShuttingDown))
    ));
}

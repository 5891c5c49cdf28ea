use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use helm_core::{ConcurrencyError, Error, Fault, FaultKind, PromiseError, ThreadContext};
use helm_runtime::{FaultEvent, Promise, Runtime, RuntimeConfig, ShutdownPhase};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.workers.threads = 2;
    config.primary.tick_interval_ms = 2;
    config
}

fn start() -> Runtime {
    helm_runtime::logging::init_test_logging();
    Runtime::builder(test_config()).build().unwrap()
}

#[test]
fn test_sync_and_async_contexts() {
    let runtime = start();
    let (tx, rx) = mpsc::channel();

    let primary = runtime.primary_thread().clone();
    let sync_tx = tx.clone();
    runtime
        .scheduler()
        .run_sync(move || sync_tx.send(("sync", primary.current_context())).unwrap())
        .unwrap();

    let primary = runtime.primary_thread().clone();
    runtime
        .scheduler()
        .run_async(move || tx.send(("async", primary.current_context())).unwrap())
        .unwrap();

    let mut seen = vec![rx.recv_timeout(WAIT).unwrap(), rx.recv_timeout(WAIT).unwrap()];
    seen.sort();
    assert_eq!(
        seen,
        vec![("async", ThreadContext::Worker), ("sync", ThreadContext::Primary)]
    );
    assert_eq!(runtime.current_context(), ThreadContext::Worker);
}

#[test]
fn test_continuation_runs_on_primary() {
    let runtime = start();
    let (tx, rx) = mpsc::channel();
    let primary = runtime.primary_thread().clone();

    let done = runtime.scheduler().supply_async_then_sync(
        || Ok(21),
        move |value: i32| {
            tx.send((value * 2, primary.is_current())).unwrap();
            Ok(())
        },
    );

    assert!(done.join().is_ok());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (42, true));
}

#[test]
fn test_failed_supplier_is_promise_fault() {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let observer = move |fault: &Fault| -> helm_core::Result<()> {
        let _ = tx.lock().unwrap().send(fault.kind());
        Ok(())
    };

    let runtime = Runtime::builder(test_config())
        .with_fault_observer(Arc::new(observer))
        .build()
        .unwrap();

    let consumed = Arc::new(AtomicUsize::new(0));
    let counter = consumed.clone();
    let done = runtime.scheduler().supply_async_then_sync(
        || -> helm_core::Result<u32> { Err(Error::runtime("no value")) },
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );

    assert!(matches!(
        done.join(),
        Err(Error::Promise(PromiseError::Failed(_)))
    ));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), FaultKind::PromiseChain);
    assert_eq!(consumed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_promise_chain_across_threads() {
    let runtime = start();
    let primary = runtime.primary_thread().clone();

    let order: Promise<Vec<&'static str>> = runtime
        .scheduler()
        .supply_async(|| Ok(vec!["fetched"]))
        .then_apply_delayed_sync(Duration::from_millis(5), move |mut steps| {
            assert!(primary.is_current());
            steps.push("validated");
            Ok(steps)
        })
        .then_apply_async(|mut steps| {
            steps.push("stored");
            Ok(steps)
        });

    assert_eq!(order.join().unwrap(), vec!["fetched", "validated", "stored"]);
    // late steps on a finished promise still run
    let count = order.then_apply_sync(|steps| Ok(steps.len())).join().unwrap();
    assert_eq!(count, 3);
}

#[test]
fn test_cancelled_promise_never_supplies() {
    let runtime = start();
    let supplied = Arc::new(AtomicUsize::new(0));
    let counter = supplied.clone();

    let promise = runtime
        .scheduler()
        .supply_delayed_sync(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    assert!(promise.cancel());
    assert!(matches!(
        promise.join(),
        Err(Error::Promise(PromiseError::Cancelled))
    ));

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(supplied.load(Ordering::SeqCst), 0);
}

#[test]
fn test_task_panic_reaches_fault_subscribers() {
    let runtime = start();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let _subscription = runtime
        .events()
        .subscribe::<FaultEvent>()
        .handler(move |event| {
            let _ = tx.lock().unwrap().send((event.fault.kind(), event.context));
            Ok(())
        })
        .register()
        .unwrap();

    runtime
        .scheduler()
        .run_sync(|| panic!("tick went wrong"))
        .unwrap();

    let (kind, context) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(kind, FaultKind::SchedulerTask);
    assert_eq!(context, ThreadContext::Primary);
    assert!(runtime.faults().reported_count() >= 1);
}

#[test]
fn test_rendezvous_from_worker() {
    let runtime = start();
    let scheduler = runtime.scheduler().clone();
    let ticks = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    // a counter bumped on every primary tick while the loop is free
    fn bump(scheduler: helm_runtime::Scheduler, ticks: Arc<AtomicUsize>) {
        ticks.fetch_add(1, Ordering::SeqCst);
        let next = scheduler.clone();
        let _ = scheduler.run_sync(move || bump(next, ticks));
    }
    bump(scheduler.clone(), ticks.clone());

    let worker_ticks = ticks.clone();
    runtime
        .scheduler()
        .run_async(move || {
            let guard = scheduler.rendezvous().unwrap();
            let before = worker_ticks.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            let after = worker_ticks.load(Ordering::SeqCst);
            guard.release();
            tx.send(before == after).unwrap();
        })
        .unwrap();

    assert!(rx.recv_timeout(WAIT).unwrap());
}

#[test]
fn test_shutdown_releases_bound_subscriptions() {
    let runtime = start();

    let subscription = runtime
        .events()
        .subscribe::<String>()
        .handler(|_| Ok(()))
        .register()
        .unwrap()
        .bind_with(runtime.registry())
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let order = order.clone();
        runtime
            .registry()
            .bind_fn(move || {
                order.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
    }

    assert!(runtime.shutdown());
    assert!(!subscription.is_active());
    assert!(runtime.events().is_closed());
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    assert_eq!(runtime.shutdown_phase(), ShutdownPhase::Stopped);

    // idempotent
    assert!(!runtime.shutdown());
    assert!(runtime.scheduler().run_async(|| {}).is_err());
    assert!(runtime.scheduler().run_sync(|| {}).is_err());
}

#[test]
fn test_shutdown_on_primary_releases_waiting_workers() {
    let runtime = Arc::new(start());
    let (waiting_tx, waiting_rx) = mpsc::channel::<()>();
    let (outcome_tx, outcome_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let handle = runtime.clone();
    runtime
        .scheduler()
        .run_sync(move || {
            // hold the tick until the worker's request is queued behind us
            waiting_rx.recv_timeout(WAIT).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            done_tx.send(handle.shutdown()).unwrap();
        })
        .unwrap();

    let scheduler = runtime.scheduler().clone();
    runtime
        .scheduler()
        .run_async(move || {
            waiting_tx.send(()).unwrap();
            let outcome = scheduler.rendezvous();
            outcome_tx
                .send(matches!(
                    outcome,
                    Err(Error::Concurrency(ConcurrencyError::Interrupted))
                ))
                .unwrap();
        })
        .unwrap();

    assert!(done_rx.recv_timeout(WAIT).unwrap());
    assert!(outcome_rx.recv_timeout(WAIT).unwrap());
    assert_eq!(runtime.shutdown_phase(), ShutdownPhase::Stopped);
}

#[test]
fn test_out_of_range_delay_is_an_error() {
    let runtime = start();
    assert!(runtime
        .scheduler()
        .run_later_async(Duration::MAX, || {})
        .is_err());
    assert!(runtime
        .scheduler()
        .run_later_sync(Duration::MAX, || {})
        .is_err());
}

#[test]
fn test_periodic_cleanup_prunes_registry() {
    helm_runtime::logging::init_test_logging();
    let mut config = test_config();
    config.cleanup.initial_delay_ms = 10;
    config.cleanup.period_ms = 10;
    let runtime = Runtime::builder(config).build().unwrap();

    let released = runtime.registry().bind_fn(|| Ok(())).unwrap();
    helm_core::Terminable::terminate(&*released).unwrap();
    // the cleanup task plus the released closure
    assert_eq!(runtime.registry().len(), 2);

    let deadline = std::time::Instant::now() + WAIT;
    while runtime.registry().len() > 1 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(runtime.registry().len(), 1);
}

#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helm.json");
    std::fs::write(
        &path,
        r#"{ "workers": { "threads": 3 }, "events": { "unregister_strategy": "deferred" } }"#,
    )
    .unwrap();

    let runtime = Runtime::new(path.to_str()).unwrap();
    assert_eq!(runtime.config().workers.threads, 3);
    assert_eq!(
        runtime.events().strategy(),
        helm_runtime::UnregisterStrategy::Deferred
    );
}

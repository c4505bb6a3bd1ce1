//! Tests for event loop groups.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use horizon_datagram_core::{
    Completion, EventLoopGroup, EventLoopGroupConfig, LoopError, local,
};
use parking_lot::Mutex;

fn flush(event_loop: &horizon_datagram_core::EventLoop) {
    let done = Completion::new();
    let signal = done.clone();
    event_loop
        .execute(move || {
            signal.complete(());
        })
        .unwrap();
    done.wait_timeout(Duration::from_secs(2)).unwrap();
}

#[test]
fn test_round_robin_visits_every_loop() {
    let group = EventLoopGroup::with_threads(3).unwrap();

    let ids: Vec<usize> = (0..6)
        .map(|_| group.assign_loop().unwrap().id().index())
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);

    group.shutdown_gracefully(Duration::from_secs(1)).wait();
}

#[test]
fn test_least_loaded_prefers_fewest_channels() {
    let group = EventLoopGroup::with_threads(3).unwrap();
    let loops = group.loops();

    loops[0].register_channel();
    loops[0].register_channel();
    loops[1].register_channel();

    assert_eq!(group.assign_least_loaded().unwrap().id().index(), 2);

    loops[2].register_channel();
    loops[2].register_channel();
    assert_eq!(group.assign_least_loaded().unwrap().id().index(), 1);

    loops[1].register_channel();
    // All loops carry two channels; the lowest id wins.
    assert_eq!(group.assign_least_loaded().unwrap().id().index(), 0);

    group.shutdown_gracefully(Duration::from_secs(1)).wait();
}

#[test]
fn test_same_loop_serializes_work() {
    let group = EventLoopGroup::with_threads(2).unwrap();
    let event_loop = group.assign_loop().unwrap();

    let threads = Arc::new(Mutex::new(HashSet::new()));
    let counter = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let event_loop = event_loop.clone();
            let threads = threads.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let threads = threads.clone();
                    let counter = counter.clone();
                    event_loop
                        .execute(move || {
                            threads.lock().insert(thread::current().id());
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for submitter in submitters {
        submitter.join().unwrap();
    }
    flush(&event_loop);

    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert_eq!(threads.lock().len(), 1);

    group.shutdown_gracefully(Duration::from_secs(1)).wait();
}

#[test]
fn test_shutdown_drains_queued_tasks() {
    let group = EventLoopGroup::with_threads(1).unwrap();
    let event_loop = group.assign_loop().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let started = Completion::new();
    let gate = Completion::new();
    let (started_signal, gate_wait) = (started.clone(), gate.clone());
    event_loop
        .execute(move || {
            started_signal.complete(());
            gate_wait.wait()
        })
        .unwrap();
    started.wait_timeout(Duration::from_secs(2)).unwrap();

    for _ in 0..5 {
        let ran = ran.clone();
        event_loop
            .execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let termination = group.shutdown_gracefully(Duration::from_secs(5));
    gate.complete(());
    let report = termination.wait_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 5);
    assert_eq!(report.drained, 5);
    assert_eq!(report.cancelled, 0);
}

#[test]
fn test_shutdown_cancels_tasks_after_deadline() {
    let group = EventLoopGroup::with_threads(1).unwrap();
    let event_loop = group.assign_loop().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    event_loop
        .execute(|| thread::sleep(Duration::from_millis(100)))
        .unwrap();
    for _ in 0..3 {
        let ran = ran.clone();
        event_loop
            .execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let report = group
        .shutdown_gracefully(Duration::from_millis(10))
        .wait_timeout(Duration::from_secs(5))
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(report.cancelled, 3);
}

#[test]
fn test_execute_after_shutdown_fails() {
    let group = EventLoopGroup::with_threads(1).unwrap();
    let event_loop = group.assign_loop().unwrap();

    group.shutdown_gracefully(Duration::from_secs(1)).wait();

    assert!(!event_loop.is_running());
    assert_eq!(event_loop.execute(|| {}), Err(LoopError::Shutdown));
    assert_eq!(event_loop.termination().get().map(|r| r.cancelled), Some(0));
}

#[test]
fn test_loop_shutdown_hooks_run_on_loop() {
    let group = EventLoopGroup::with_threads(1).unwrap();
    let event_loop = group.assign_loop().unwrap();
    let fired = Arc::new(Mutex::new(Vec::new()));

    let cancelled = {
        let fired = fired.clone();
        let registered = Completion::new();
        let signal = registered.clone();
        event_loop
            .execute(move || {
                let first = fired.clone();
                local::on_shutdown(move || {
                    first.lock().push(("first", local::is_event_loop_thread()))
                });
                let dropped = fired.clone();
                let id = local::on_shutdown(move || dropped.lock().push(("dropped", true)));
                let last = fired.clone();
                local::on_shutdown(move || last.lock().push(("last", true)));
                signal.complete(id);
            })
            .unwrap();
        registered.wait_timeout(Duration::from_secs(2)).unwrap()
    };

    let id = cancelled.unwrap();
    let removed = Completion::new();
    let signal = removed.clone();
    event_loop
        .execute(move || {
            signal.complete(local::cancel_shutdown_hook(id));
        })
        .unwrap();
    assert_eq!(removed.wait_timeout(Duration::from_secs(2)), Some(true));

    group.shutdown_gracefully(Duration::from_secs(1)).wait();
    assert_eq!(*fired.lock(), vec![("first", true), ("last", true)]);
}

#[test]
fn test_current_loop_inside_task() {
    let group = EventLoopGroup::with_threads(2).unwrap();
    let event_loop = group.assign_loop().unwrap();

    let seen = Completion::new();
    let signal = seen.clone();
    event_loop
        .execute(move || {
            signal.complete(local::current_loop().map(|l| l.id()));
        })
        .unwrap();

    assert_eq!(
        seen.wait_timeout(Duration::from_secs(2)),
        Some(Some(event_loop.id()))
    );
    assert!(local::current_loop().is_none());

    group.shutdown_gracefully(Duration::from_secs(1)).wait();
}

#[test]
fn test_dropping_non_daemon_group_stops_loops() {
    let group = EventLoopGroup::new(EventLoopGroupConfig::new().threads(1)).unwrap();
    let event_loop = group.assign_loop().unwrap();
    let termination = event_loop.termination();

    drop(group);

    assert!(termination.wait_timeout(Duration::from_secs(5)).is_some());
    assert!(!event_loop.is_running());
}

#[test]
fn test_dropping_daemon_group_detaches() {
    let group = EventLoopGroup::new(EventLoopGroupConfig::new().threads(1).daemon(true)).unwrap();
    let event_loop = group.assign_loop().unwrap();

    drop(group);

    assert!(event_loop.is_running());
    flush(&event_loop);
}

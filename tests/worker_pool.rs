//! Worker pool behavior: least-loaded placement, same-worker mutual
//! exclusion, deadline cancellation, and shutdown draining.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bundle_transport::worker::{ConnectionManager, Signal, Worker};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < timeout, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn add_assigns_to_least_loaded_worker() {
    let manager = ConnectionManager::new(3).unwrap();

    // Six connections that stay live until asked to close: placement must
    // level out at two per worker, whatever the order.
    for _ in 0..6 {
        let added = manager.add(None, |handle| async move {
            handle.notified().await;
            Ok(())
        });
        assert!(added);
    }

    let loads = manager.loads();
    assert_eq!(loads, vec![2, 2, 2], "placement must follow live counts");

    manager.shutdown();
}

#[test]
fn add_without_workers_fails() {
    let manager = ConnectionManager::new(0).unwrap();
    let added = manager.add(None, |_handle| async move { Ok(()) });
    assert!(!added);
    manager.shutdown();
}

#[test]
fn same_worker_steps_are_mutually_exclusive() {
    let worker = Worker::spawn(0).unwrap();
    let in_step = Arc::new(AtomicUsize::new(0));
    let max_overlap = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

    for _ in 0..4 {
        let in_step = in_step.clone();
        let max_overlap = max_overlap.clone();
        let done = done_tx.clone();
        worker.add_connection(None, move |_handle| async move {
            for _ in 0..50 {
                let now = in_step.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap.fetch_max(now, Ordering::SeqCst);
                // Real work inside one cooperative step; if two connections
                // on this worker ever ran steps concurrently, the counter
                // would exceed one here.
                std::thread::sleep(Duration::from_micros(300));
                in_step.fetch_sub(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
            done.send(()).ok();
            Ok(())
        });
    }
    drop(done_tx);

    for _ in 0..4 {
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("all connections should finish");
    }
    assert_eq!(max_overlap.load(Ordering::SeqCst), 1);

    worker.begin_shutdown();
    worker.join();
}

#[test]
fn expired_deadline_cancels_before_any_other_outcome() {
    let worker = Worker::spawn(0).unwrap();
    let completed = Arc::new(AtomicBool::new(false));

    let flag = completed.clone();
    // Deadline already in the past, never extended; the task itself would
    // run forever.
    worker.add_connection(Some(Duration::ZERO), move |_handle| async move {
        std::future::pending::<()>().await;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    wait_until("timeout cancellation", Duration::from_secs(5), || {
        worker.load() == 0
    });
    assert!(!completed.load(Ordering::SeqCst));

    worker.begin_shutdown();
    worker.join();
}

#[test]
fn deadline_extension_keeps_a_connection_alive() {
    let worker = Worker::spawn(0).unwrap();
    let completed = Arc::new(AtomicBool::new(false));

    let flag = completed.clone();
    worker.add_connection(Some(Duration::from_millis(80)), move |handle| async move {
        // Extend a few times across what would otherwise be several expiries.
        for _ in 0..5 {
            handle.extend_deadline(Duration::from_millis(200));
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    wait_until("task completion", Duration::from_secs(5), || {
        worker.load() == 0
    });
    assert!(completed.load(Ordering::SeqCst));

    worker.begin_shutdown();
    worker.join();
}

#[test]
fn shutdown_requests_close_then_drains() {
    let worker = Worker::spawn(0).unwrap();
    let closed_cleanly = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let counter = closed_cleanly.clone();
        worker.add_connection(None, move |handle| async move {
            // Stay live until the worker asks us to close.
            handle.notified().await;
            if handle.close_requested() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
    }

    wait_until("tasks admitted", Duration::from_secs(5), || {
        worker.load() == 3
    });

    let drained = Arc::new(AtomicBool::new(false));
    let flag = drained.clone();
    worker.signal().on_shutdown(move || {
        flag.store(true, Ordering::SeqCst);
    });

    worker.begin_shutdown();
    worker.join();

    assert_eq!(closed_cleanly.load(Ordering::SeqCst), 3);
    assert!(drained.load(Ordering::SeqCst));
}

#[test]
fn manager_survives_task_errors_and_panics() {
    let manager = ConnectionManager::new(1).unwrap();

    manager.add(None, |_handle| async move {
        Err(bundle_transport::ProtocolError::ConnectionClosed)
    });
    manager.add(None, |_handle| async move {
        panic!("task panic must not take the worker down");
    });

    // The worker keeps scheduling new work afterwards.
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    manager.add(None, move |_handle| async move {
        done_tx.send(()).ok();
        Ok(())
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker should still schedule tasks");
    manager.shutdown();
}

#[test]
fn accept_loop_signal_stops_serving() {
    // Exercise the Signal contract the accept loop relies on.
    let signal = Signal::new();
    assert!(!signal.is_marked());
    let completed = Arc::new(AtomicBool::new(false));
    let flag = completed.clone();
    signal.on_shutdown(move || flag.store(true, Ordering::SeqCst));

    signal.mark_for_shutdown();
    assert!(signal.is_marked());
    signal.complete_shutdown();
    assert!(completed.load(Ordering::SeqCst));
}

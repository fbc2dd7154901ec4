//! # Connection Workers
//!
//! A [`Worker`] owns one OS thread and runs an arbitrary number of logical
//! connections as cooperatively scheduled tasks on a current-thread runtime.
//! A connection's turn always runs to completion before the next connection
//! on the same worker is considered, so per-connection state needs no locks;
//! connections on different workers run fully in parallel and share nothing
//! mutable.
//!
//! Each admitted task gets an [`ConnectionHandle`] carrying the two pieces of
//! state that *are* shared across threads: a close-request flag the worker
//! (or anyone holding the handle) may set, and a deadline the owning protocol
//! extends as traffic flows. A watchdog raced against every task cancels it
//! with a timeout error when the deadline passes unextended.
//!
//! Shutdown requests close on every live connection, keeps servicing them for
//! a grace period, then force-cancels whatever is left.

pub mod manager;
pub mod signal;

pub use manager::ConnectionManager;
pub use signal::Signal;

use crate::config::SHUTDOWN_GRACE;
use crate::error::{ProtocolError, Result};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, error, info, trace, warn};

/// How often an idle watchdog re-reads a handle that currently has no
/// deadline set.
const WATCHDOG_IDLE_POLL: Duration = Duration::from_millis(500);

/// How long a draining worker sleeps between liveness checks.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Per-connection state shared between the worker, the channel, and the
/// owning protocol. Everything here is atomic; all richer state stays on the
/// worker thread.
pub struct ConnectionHandle {
    close_requested: AtomicBool,
    /// Deadline in microseconds since `epoch`; 0 means no deadline.
    deadline_micros: AtomicU64,
    epoch: Instant,
    notify: Notify,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self {
            close_requested: AtomicBool::new(false),
            deadline_micros: AtomicU64::new(0),
            epoch: Instant::now(),
            notify: Notify::new(),
        }
    }

    /// Ask the connection to close at its next turn, and wake it.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Move the deadline to `window` from now.
    pub fn extend_deadline(&self, window: Duration) {
        let target = self.epoch.elapsed() + window;
        self.deadline_micros
            .store(target.as_micros().max(1) as u64, Ordering::SeqCst);
    }

    /// Remove the deadline entirely, disabling the watchdog.
    pub fn clear_deadline(&self) {
        self.deadline_micros.store(0, Ordering::SeqCst);
    }

    /// The current deadline as an instant, if one is set.
    pub fn deadline_instant(&self) -> Option<Instant> {
        let micros = self.deadline_micros.load(Ordering::SeqCst);
        (micros != 0).then(|| self.epoch + Duration::from_micros(micros))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.deadline_instant()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Wake the connection's turn loop (e.g. after queueing outbound work).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until woken. Intended for the single task driving this
    /// connection.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when the handle's deadline passes. Extensions made while waiting
/// are observed; a handle with no deadline parks until one appears.
pub async fn deadline_expired(handle: &ConnectionHandle) {
    loop {
        match handle.deadline_instant() {
            Some(deadline) if Instant::now() >= deadline => return,
            Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
            None => tokio::time::sleep(WATCHDOG_IDLE_POLL).await,
        }
    }
}

/// A connection task: built on the worker's thread from a `Send` supplier,
/// then driven locally (the future itself does not need to be `Send`).
pub type TaskSupplier =
    Box<dyn FnOnce(Arc<ConnectionHandle>) -> LocalBoxFuture<'static, Result<()>> + Send>;

struct Admission {
    timeout: Option<Duration>,
    supplier: TaskSupplier,
}

/// One OS thread multiplexing many logical connections.
pub struct Worker {
    index: usize,
    intake: mpsc::UnboundedSender<Admission>,
    live: Arc<AtomicUsize>,
    signal: Signal,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread with its own current-thread runtime.
    pub fn spawn(index: usize) -> std::io::Result<Self> {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicUsize::new(0));
        let signal = Signal::new();

        let thread = {
            let live = live.clone();
            let signal = signal.clone();
            std::thread::Builder::new()
                .name(format!("bundle-worker-{index}"))
                .spawn(move || run_worker(index, intake_rx, live, signal))?
        };

        Ok(Self {
            index,
            intake: intake_tx,
            live,
            signal,
            thread: Some(thread),
        })
    }

    /// Number of connections currently admitted (including queued ones).
    pub fn load(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueue a connection task and wake the worker loop. `timeout` becomes
    /// the task's initial deadline; `None` disables the watchdog until the
    /// task sets a deadline itself.
    ///
    /// Returns false if the worker has already shut down.
    pub fn add_connection<F, Fut>(&self, timeout: Option<Duration>, task: F) -> bool
    where
        F: FnOnce(Arc<ConnectionHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.live.fetch_add(1, Ordering::SeqCst);
        let supplier: TaskSupplier = Box::new(move |handle| task(handle).boxed_local());
        let admission = Admission { timeout, supplier };
        if self.intake.send(admission).is_err() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Cooperative shutdown: close all connections, drain within the grace
    /// period, then force-cancel. Does not block; use [`Worker::join`].
    pub fn begin_shutdown(&self) {
        self.signal.mark_for_shutdown();
    }

    /// The worker's shutdown signal (for completion callbacks).
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Wait for the worker thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                // Teardown-time failure; nothing to recover.
                error!(worker = self.index, "worker thread panicked");
            }
        }
    }
}

fn run_worker(
    index: usize,
    mut intake: mpsc::UnboundedReceiver<Admission>,
    live: Arc<AtomicUsize>,
    signal: Signal,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = index, error = %e, "failed to build worker runtime");
            signal.complete_shutdown();
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, async {
        let mut tasks: Vec<(Arc<ConnectionHandle>, tokio::task::JoinHandle<()>)> = Vec::new();

        loop {
            tokio::select! {
                _ = signal.notified() => {
                    if signal.is_marked() {
                        break;
                    }
                }
                admission = intake.recv() => {
                    match admission {
                        Some(admission) => {
                            let entry = admit(index, admission, &live);
                            tasks.push(entry);
                        }
                        // All handles dropped; nothing can be admitted anymore.
                        None => break,
                    }
                }
            }
            tasks.retain(|(_, join)| !join.is_finished());
        }

        drain(index, &mut tasks).await;
    });

    signal.complete_shutdown();
    trace!(worker = index, "worker stopped");
}

fn admit(
    worker: usize,
    admission: Admission,
    live: &Arc<AtomicUsize>,
) -> (Arc<ConnectionHandle>, tokio::task::JoinHandle<()>) {
    let handle = Arc::new(ConnectionHandle::new());
    if let Some(timeout) = admission.timeout {
        handle.extend_deadline(timeout);
    }

    let task = (admission.supplier)(handle.clone());
    let live = live.clone();
    let watchdog_handle = handle.clone();

    let join = tokio::task::spawn_local(async move {
        let outcome = {
            // Biased so a task that observed its own deadline reports it
            // through its protocol hooks before the hard backstop fires.
            tokio::select! {
                biased;
                caught = AssertUnwindSafe(task).catch_unwind() => match caught {
                    Ok(result) => result,
                    Err(_) => {
                        error!(worker, "connection task panicked; treating as no-op");
                        Ok(())
                    }
                },
                _ = deadline_expired(&watchdog_handle) => Err(ProtocolError::Timeout),
            }
        };

        match outcome {
            Ok(()) => trace!(worker, "connection finished"),
            Err(ref e) if e.is_authentication() => {
                info!(worker, error = %e, "connection authentication failed")
            }
            Err(ProtocolError::Rejected) | Err(ProtocolError::UnknownSelector(_)) => {
                trace!(worker, "inbound connection rejected")
            }
            Err(ProtocolError::Timeout) => info!(worker, "connection timed out"),
            Err(ref e) if e.is_graceful_close() => trace!(worker, "connection closed by peer"),
            Err(ref e) => warn!(worker, error = %e, "connection failed"),
        }

        live.fetch_sub(1, Ordering::SeqCst);
    });

    (handle, join)
}

/// Request close on everything, keep servicing for the grace period, then
/// abort what remains.
async fn drain(worker: usize, tasks: &mut Vec<(Arc<ConnectionHandle>, tokio::task::JoinHandle<()>)>) {
    for (handle, _) in tasks.iter() {
        handle.request_close();
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        tasks.retain(|(_, join)| !join.is_finished());
        if tasks.is_empty() {
            debug!(worker, "all connections drained");
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                worker,
                remaining = tasks.len(),
                "shutdown grace period expired; force-cancelling"
            );
            for (_, join) in tasks.iter() {
                join.abort();
            }
            tasks.clear();
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_extension_moves_forward() {
        let handle = ConnectionHandle::new();
        assert!(handle.deadline_instant().is_none());
        assert!(!handle.expired());

        handle.extend_deadline(Duration::from_secs(60));
        let first = handle.deadline_instant().unwrap();
        assert!(!handle.expired());

        handle.extend_deadline(Duration::from_secs(120));
        let second = handle.deadline_instant().unwrap();
        assert!(second > first);

        handle.clear_deadline();
        assert!(handle.deadline_instant().is_none());
    }

    #[test]
    fn zero_window_deadline_expires_immediately() {
        let handle = ConnectionHandle::new();
        handle.extend_deadline(Duration::ZERO);
        assert!(handle.expired());
    }

    #[test]
    fn close_request_is_visible() {
        let handle = ConnectionHandle::new();
        assert!(!handle.close_requested());
        handle.request_close();
        assert!(handle.close_requested());
    }

    #[test]
    fn worker_runs_and_counts_tasks() {
        let worker = Worker::spawn(0).unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let added = worker.add_connection(None, move |_handle| async move {
            done_tx.send(()).ok();
            Ok(())
        });
        assert!(added);

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task should run");

        worker.begin_shutdown();
        worker.join();
    }

    #[test]
    fn worker_cancels_expired_tasks() {
        let worker = Worker::spawn(0).unwrap();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        worker.add_connection(Some(Duration::ZERO), move |_handle| async move {
            std::future::pending::<()>().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let start = Instant::now();
        while worker.load() > 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(worker.load(), 0, "expired task should be cancelled");
        assert!(!finished.load(Ordering::SeqCst));

        worker.begin_shutdown();
        worker.join();
    }
}

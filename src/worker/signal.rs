//! # Shutdown Signal
//!
//! A waitable latch shared between an event loop and the threads that manage
//! it: any thread may wake the loop, mark it for cooperative shutdown, and
//! register callbacks to run once the loop has fully drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

type CompletionHook = Box<dyn FnOnce() + Send>;

struct SignalInner {
    notify: Notify,
    shutdown: AtomicBool,
    completed: AtomicBool,
    hooks: Mutex<Vec<CompletionHook>>,
}

/// Cloneable handle to one loop's wake/shutdown state.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wake the owning loop without changing any state.
    pub fn wake(&self) {
        self.inner.notify.notify_one();
    }

    /// Ask the owning loop to shut down; the loop observes the flag at its
    /// next turn. Safe to call from any thread, any number of times.
    pub fn mark_for_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    /// Whether shutdown has been requested.
    pub fn is_marked(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Wait until woken. Intended for the single owning loop.
    pub async fn notified(&self) {
        self.inner.notify.notified().await;
    }

    /// Register a callback to run once the owning loop finishes draining.
    /// If shutdown already completed, the callback runs immediately.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        if self.inner.completed.load(Ordering::SeqCst) {
            hook();
            return;
        }
        let mut hooks = match self.inner.hooks.lock() {
            Ok(hooks) => hooks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the lock so a completing loop cannot slip past us.
        if self.inner.completed.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Called by the owning loop after it has drained; runs completion hooks
    /// exactly once.
    pub fn complete_shutdown(&self) {
        let hooks = {
            let mut hooks = match self.inner.hooks.lock() {
                Ok(hooks) => hooks,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.inner.completed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

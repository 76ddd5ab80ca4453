//! Small task utilities: a stoppable periodic task and a one-shot ready latch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

/// Runs a callback on a fixed interval until stopped.
pub struct RepeatableTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RepeatableTask {
    /// Spawn the task. The callback fires immediately and then once per
    /// `period` until [`RepeatableTask::stop`] is called.
    pub fn spawn<F>(name: &'static str, period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            debug!(task = name, "repeatable task starting");
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => callback(),
                    _ = stopped.changed() => break,
                }
            }
            debug!(task = name, "repeatable task stopped");
        });
        Self {
            name,
            stop,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(&self) {
        debug!(task = self.name, "repeatable task is stopping");
        let _ = self.stop.send(true);
        let handle = self.handle.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[derive(Default)]
struct ReadyInner {
    set: AtomicBool,
    notify: Notify,
}

/// A one-shot latch: set once, observed by any number of waiters.
#[derive(Clone, Default)]
pub struct Ready {
    inner: Arc<ReadyInner>,
}

impl Ready {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        if !self.inner.set.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Wait until set, up to `timeout`. Returns whether the latch is set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.notify.notified();
                if self.is_set() {
                    return;
                }
                notified.await;
            }
        })
        .await;
        waited.is_ok() || self.is_set()
    }
}

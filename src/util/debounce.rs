//! Trailing-edge debouncer.
//!
//! Each trigger cancels the previously scheduled invocation and schedules a
//! new one `delay` later, so a burst of triggers collapses to a single run of
//! the last submitted work.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::MutexExt;

pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `work` to run after the debounce delay, replacing any
    /// previously scheduled invocation that has not started yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let mut pending = self.pending.lock_or_recover("debounce.trigger");
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
        }));
    }

    /// Drop any scheduled invocation without running it.
    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock_or_recover("debounce.cancel").take() {
            handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

//! Cancellable single-shot timers kept on a session.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A delayed action running on its own task.
///
/// Dropping the handle does not cancel the action; only [`cancel`] does.
///
/// [`cancel`]: DelayedTask::cancel
#[derive(Debug)]
pub struct DelayedTask {
    handle: JoinHandle<()>,
}

impl DelayedTask {
    /// Run `action` after `delay`.
    pub fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self { handle }
    }

    /// Abort the timer. A timer that already fired is unaffected.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

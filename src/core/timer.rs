use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Handle to a spawned delayed action; dropping it cancels the action.
///
/// Stored beside the state it governs (a pending envelope, the batch buffer, the reconnect
/// plan) so replacing or clearing that state cancels the timer with it.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `action` after `delay` on the current tokio runtime.
    pub fn after<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            action.await;
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

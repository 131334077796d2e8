//! Handle for a periodic background loop.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A spawned loop that exits when its shutdown channel flips to `true`.
pub struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn new(name: &'static str, shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals shutdown and waits for the current iteration to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, error = %e, "background task ended abnormally");
        } else {
            tracing::debug!(task = self.name, "background task stopped");
        }
    }
}

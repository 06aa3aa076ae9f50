use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Broadcasts a one-way shutdown request to background tasks.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown was requested or the signal was dropped.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // wait_for only errors when the sender is gone, which also means shut down.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// A named long-running task that can be given a grace period on shutdown.
pub struct BackgroundTask {
    name: String,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "Spawning background task");
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the task to finish without a deadline. For tasks that must
    /// not be cut off, such as a backup run with an upload in flight.
    pub async fn join(self) {
        match self.handle.await {
            Ok(()) => debug!(task = %self.name, "Background task stopped"),
            Err(e) => warn!(task = %self.name, error = %e, "Background task ended abnormally"),
        }
    }

    /// Waits up to `grace` for the task to finish, then aborts it.
    pub async fn wait(self, grace: Duration) {
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => debug!(task = %self.name, "Background task stopped"),
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "Background task ended abnormally"),
            Err(_) => {
                warn!(task = %self.name, grace_secs = grace.as_secs(), "Background task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

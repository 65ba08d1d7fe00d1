//! Shutdown signalling for the pipeline workers.
//!
//! Every worker subscribes to a `tokio::sync::broadcast` channel and
//! `select!`s on it alongside its queue.

use tokio::sync::broadcast;

/// Coordinates shutdown across all pipeline workers.
///
/// Workers call [`ShutdownController::subscribe`] to get a receiver, then
/// `select!` on it alongside their main loop. [`ShutdownController::shutdown`]
/// notifies every receiver.
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Notify every subscriber.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

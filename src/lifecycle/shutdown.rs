//! Shutdown coordination for the dispatcher.

use tokio::sync::broadcast;

use crate::lifecycle::signals::ShutdownSignals;

/// Coordinator for shutdown.
///
/// Provides a broadcast channel the dispatcher loop subscribes to; OS signals
/// or tests trigger it.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Trigger once SIGINT or SIGTERM arrives. Handlers are installed before returning.
    pub fn trigger_on_signals(&self) -> std::io::Result<()> {
        let mut signals = ShutdownSignals::register()?;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let name = signals.recv().await;
            tracing::info!(signal = name, "Received signal, shutting down");
            let _ = tx.send(());
        });
        Ok(())
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

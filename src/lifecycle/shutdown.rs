//! Shutdown coordination for the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Coordinator for `stop()`.
///
/// The selector thread polls the flag once per iteration; async tasks such
/// as pending retransmissions subscribe to the broadcast channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Subscribe to the shutdown signal.
    ///
    /// Check [`Shutdown::is_triggered`] after subscribing; a trigger that
    /// happened before the subscription is not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Returns `false` if it was already triggered.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_one_shot() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        clone.trigger();
        assert!(shutdown.is_triggered());
    }
}

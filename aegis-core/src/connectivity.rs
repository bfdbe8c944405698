//! Connectivity signal for the offline queue.
//!
//! A watch channel carrying the current online/offline state. The host
//! application feeds transitions in from whatever platform signal it has;
//! the sync driver wakes on offline→online edges to replay queued actions.

use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch for state changes. Only edges wake the receiver; reporting the
    /// current state again is a no-op.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn set_online(&self) {
        if self.tx.send_if_modified(|online| {
            let changed = !*online;
            *online = true;
            changed
        }) {
            info!("connectivity restored");
        }
    }

    pub fn set_offline(&self) {
        if self.tx.send_if_modified(|online| {
            let changed = *online;
            *online = false;
            changed
        }) {
            info!("connectivity lost");
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_edges_wake_subscribers() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set_online();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_repeated_reports_do_not_signal() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set_online();
        assert!(!rx.has_changed().unwrap());

        monitor.set_offline();
        assert!(rx.has_changed().unwrap());
    }
}

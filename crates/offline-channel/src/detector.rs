//! Online/offline state source.

use tokio::sync::watch;

/// Reports connectivity and publishes changes.
pub trait NetworkDetector: Send + Sync {
    /// Current state, read at the moment of the call.
    fn is_online(&self) -> bool;

    /// Receiver that observes every state change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Detector driven by the host, which pushes state changes itself.
#[derive(Debug)]
pub struct ManualNetworkDetector {
    state: watch::Sender<bool>,
}

impl ManualNetworkDetector {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Publish a new state. Repeating the current state notifies nobody.
    pub fn set_online(&self, online: bool) {
        self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl NetworkDetector for ManualNetworkDetector {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_detector_publishes_changes_only() {
        let detector = ManualNetworkDetector::new(false);
        let mut rx = detector.subscribe();
        assert!(!detector.is_online());

        detector.set_online(false);
        assert!(!rx.has_changed().unwrap());

        detector.set_online(true);
        assert!(rx.has_changed().unwrap());
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(detector.is_online());
    }
}

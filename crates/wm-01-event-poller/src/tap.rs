//! Shoulder-tap wakeups.

use std::sync::Arc;

use tokio::sync::Notify;

/// A non-blocking, single-slot wakeup. Any number of taps between two waits
/// collapse into one poll cycle.
#[derive(Clone, Default)]
pub struct ShoulderTap {
    notify: Arc<Notify>,
}

impl ShoulderTap {
    /// Create a new tap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that new data may be available. Never blocks.
    pub fn tap(&self) {
        self.notify.notify_one();
    }

    /// Wait until tapped. Returns immediately if a tap arrived since the last
    /// wait.
    pub async fn tapped(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_taps_collapse() {
        let tap = ShoulderTap::new();
        tap.tap();
        tap.tap();
        tap.tap();

        // One stored permit wakes exactly one wait...
        timeout(Duration::from_millis(100), tap.tapped())
            .await
            .expect("first wait should complete");

        // ...and the collapsed extras do not wake a second one.
        assert!(timeout(Duration::from_millis(50), tap.tapped())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_tap_wakes_concurrent_waiter() {
        let tap = ShoulderTap::new();
        let waiter = tap.clone();
        let handle = tokio::spawn(async move { waiter.tapped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tap.tap();
        timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}

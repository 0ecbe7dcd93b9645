//! Poller configuration.

use std::time::Duration;

use shared_types::FirstEvent;

use crate::retry::Retry;

/// Configuration for one poller instance.
#[derive(Debug, Clone)]
pub struct EventPollerConf {
    /// Maximum items per page.
    pub event_batch_size: usize,
    /// Accumulation delay after a wakeup, letting a fuller page build up
    /// before the handler runs. Zero disables it.
    pub event_batch_timeout: Duration,
    /// How long to sleep with no wakeup before polling anyway.
    pub event_poll_timeout: Duration,
    /// Where a brand-new offset starts.
    pub first_event: FirstEvent,
    /// Name of the offset row this poller commits to.
    pub offset_name: String,
    /// Backoff policy for transient errors.
    pub retry: Retry,
}

impl EventPollerConf {
    /// Validate the configuration. Negative first-event literals are
    /// rejected; everything else is caller's choice.
    pub fn validate(&self) -> Result<(), String> {
        if let FirstEvent::Sequence(n) = self.first_event {
            if n < 0 {
                return Err(format!(
                    "first-event sequence must not be negative (got {n})"
                ));
            }
        }
        if self.event_batch_size == 0 {
            return Err("event batch size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for EventPollerConf {
    fn default() -> Self {
        EventPollerConf {
            event_batch_size: 50,
            event_batch_timeout: Duration::from_millis(50),
            event_poll_timeout: Duration::from_secs(30),
            first_event: FirstEvent::Oldest,
            offset_name: "poller".to_string(),
            retry: Retry::default(),
        }
    }
}

//! Aggregator configuration.

use std::time::Duration;

use shared_types::FirstEvent;
use wm_01_event_poller::{EventPollerConf, Retry};

/// Offset row name for the aggregator's pin poller.
pub const AGGREGATOR_OFFSET_NAME: &str = "wm_aggregator";

/// Configuration for the aggregator subsystem.
#[derive(Debug, Clone)]
pub struct AggregatorConf {
    /// Maximum pins per poll page; also sizes the rewind queue.
    pub batch_size: usize,
    /// Accumulation delay after a wakeup.
    pub batch_timeout: Duration,
    /// Idle poll timeout.
    pub poll_timeout: Duration,
    /// Where a brand-new aggregator offset starts.
    pub first_event: FirstEvent,
    /// Backoff for transient store errors.
    pub retry: Retry,
    /// Byte budget for the batch/manifest cache.
    pub batch_cache_bytes: usize,
    /// Time-to-live for batch cache entries; hits extend it.
    pub batch_cache_ttl: Duration,
}

impl Default for AggregatorConf {
    fn default() -> Self {
        AggregatorConf {
            batch_size: 50,
            batch_timeout: Duration::from_millis(50),
            poll_timeout: Duration::from_secs(30),
            first_event: FirstEvent::Oldest,
            retry: Retry::default(),
            batch_cache_bytes: 1024 * 1024,
            batch_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl AggregatorConf {
    /// The poller configuration derived from this aggregator configuration.
    #[must_use]
    pub fn poller_conf(&self) -> EventPollerConf {
        EventPollerConf {
            event_batch_size: self.batch_size,
            event_batch_timeout: self.batch_timeout,
            event_poll_timeout: self.poll_timeout,
            first_event: self.first_event,
            offset_name: AGGREGATOR_OFFSET_NAME.to_string(),
            retry: self.retry.clone(),
        }
    }
}

//! Exponential backoff for transient failures.

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

/// Backoff policy: `initial * factor^n`, capped at `maximum`.
#[derive(Debug, Clone)]
pub struct Retry {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub maximum_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_delay: Duration::from_millis(100),
            maximum_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl Retry {
    /// The delay before retry attempt `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.maximum_delay.as_secs_f64()))
    }

    /// Sleep for the attempt's delay, or return `false` immediately if
    /// shutdown fires first.
    pub async fn wait(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.delay(attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }
}

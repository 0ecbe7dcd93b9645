//! Batch assembly configuration.

use std::time::Duration;

use shared_types::BatchType;

/// Fixed overhead assumed for the batch envelope when estimating payload
/// size against `batch_max_bytes`.
pub const BATCH_PAYLOAD_ESTIMATE_BASE: usize = 1024;

/// Bounds for one registered dispatcher's batch processors.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Broadcast or private.
    pub batch_type: BatchType,
    /// Maximum messages per batch.
    pub batch_max_size: usize,
    /// Maximum estimated payload bytes per batch; also the assembly queue's
    /// backpressure budget.
    pub batch_max_bytes: usize,
    /// Maximum time a partial batch waits for more work before sealing.
    pub batch_timeout: Duration,
    /// Idle time after which a processor tears itself down.
    pub dispose_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        DispatcherOptions {
            batch_type: BatchType::Broadcast,
            batch_max_size: 200,
            batch_max_bytes: 1024 * 1024,
            batch_timeout: Duration::from_millis(250),
            dispose_timeout: Duration::from_secs(120),
        }
    }
}

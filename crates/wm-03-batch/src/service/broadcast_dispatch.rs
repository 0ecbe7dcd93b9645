//! Broadcast batch dispatch: shared-storage upload plus pin submission.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::Batch;
use tracing::debug;

use crate::domain::work::DispatchState;
use crate::error::BatchError;
use crate::service::manager::DispatchHandler;
use crate::service::pin_submitter::BatchPinSubmitter;

/// Publishes broadcast batch payloads to shared storage (an external
/// runtime; only the returned payload reference matters to the core).
#[async_trait]
pub trait BatchUploader: Send + Sync {
    /// Upload a batch payload, returning its public payload reference.
    async fn upload_batch(&self, batch: &Batch) -> Result<String, BatchError>;
}

/// Records uploads and hands back deterministic references; for tests.
#[derive(Default)]
pub struct MockBatchUploader {
    uploads: Mutex<Vec<Batch>>,
}

impl MockBatchUploader {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All uploaded batches so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<Batch> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl BatchUploader for MockBatchUploader {
    async fn upload_batch(&self, batch: &Batch) -> Result<String, BatchError> {
        let payload_ref = format!("shared/{}", batch.header.id);
        self.uploads.lock().push(batch.clone());
        Ok(payload_ref)
    }
}

/// Dispatch handler for pinned broadcast batches.
pub struct BroadcastBatchDispatcher {
    uploader: Arc<dyn BatchUploader>,
    pin_submitter: Arc<BatchPinSubmitter>,
}

impl BroadcastBatchDispatcher {
    /// Build the dispatcher.
    pub fn new(uploader: Arc<dyn BatchUploader>, pin_submitter: Arc<BatchPinSubmitter>) -> Arc<Self> {
        Arc::new(BroadcastBatchDispatcher {
            uploader,
            pin_submitter,
        })
    }
}

#[async_trait]
impl DispatchHandler for BroadcastBatchDispatcher {
    async fn dispatch(&self, state: &DispatchState) -> Result<(), BatchError> {
        let batch = state
            .persisted
            .hydrate(state.messages.clone(), state.data.clone());
        let payload_ref = self.uploader.upload_batch(&batch).await?;
        debug!(batch = %batch.header.id, payload_ref = %payload_ref, "Broadcast payload published");
        self.pin_submitter
            .submit_pinned_batch(state, Some(payload_ref))
            .await
    }
}

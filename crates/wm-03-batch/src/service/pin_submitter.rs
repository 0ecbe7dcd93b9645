//! Batch pin submission.

use std::sync::Arc;

use async_trait::async_trait;
use shared_connectors::BlockchainConnector;
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{
    BatchPin, Bytes32, Operation, OpType, PreparedData, PreparedOperation,
};
use tracing::info;
use uuid::Uuid;

use crate::domain::work::DispatchState;
use crate::error::BatchError;
use wm_04_operations::{OperationHandler, OperationOutcome, OperationsError, OperationsManager};

/// Submits the anchoring pin for sealed batches, through the operation
/// manager so retries stay idempotent. Registered as the handler for
/// `BlockchainPinBatch` operations.
pub struct BatchPinSubmitter {
    store: Arc<dyn Store>,
    operations: Arc<OperationsManager>,
    blockchain: Arc<dyn BlockchainConnector>,
}

impl BatchPinSubmitter {
    /// Build the submitter; the caller registers it with the operation
    /// manager for `BlockchainPinBatch`.
    pub fn new(
        store: Arc<dyn Store>,
        operations: Arc<OperationsManager>,
        blockchain: Arc<dyn BlockchainConnector>,
    ) -> Arc<Self> {
        Arc::new(BatchPinSubmitter {
            store,
            operations,
            blockchain,
        })
    }

    /// Record and run the pin-submission operation for one sealed batch.
    pub async fn submit_pinned_batch(
        &self,
        state: &DispatchState,
        payload_ref: Option<String>,
    ) -> Result<(), BatchError> {
        let batch = &state.persisted;
        let mut op = Operation::new(
            &batch.header.namespace,
            batch.tx.id,
            OpType::BlockchainPinBatch,
            self.blockchain.name(),
        );
        op.input = serde_json::json!({
            "batch": batch.header.id.to_string(),
            "payloadRef": payload_ref,
            "contexts": state.pins.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        });
        self.operations.add_or_reuse_operation(&mut op).await?;

        info!(
            batch = %batch.header.id,
            op = %op.id,
            contexts = state.pins.len(),
            "Submitting batch pin"
        );
        let prepared = PreparedOperation {
            id: op.id,
            op_type: OpType::BlockchainPinBatch,
            data: PreparedData::BatchPin {
                batch: Box::new(batch.clone()),
                payload_ref,
                contexts: state.pins.clone(),
            },
        };
        self.operations.run_operation(prepared).await?;
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for BatchPinSubmitter {
    fn name(&self) -> &str {
        "batch_pin"
    }

    async fn prepare_operation(
        &self,
        op: &Operation,
    ) -> Result<PreparedOperation, OperationsError> {
        let batch_id: Uuid = op
            .input
            .get("batch")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| OperationsError::Store(StoreError::NotFound("batch input".into())))?;
        let batch = self
            .store
            .get_batch_by_id(&batch_id)
            .await?
            .ok_or_else(|| OperationsError::Store(StoreError::NotFound(batch_id.to_string())))?;

        let payload_ref = op
            .input
            .get("payloadRef")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let contexts: Vec<Bytes32> = op
            .input
            .get("contexts")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| Bytes32::from_hex(s).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(PreparedOperation {
            id: op.id,
            op_type: op.op_type,
            data: PreparedData::BatchPin {
                batch: Box::new(batch),
                payload_ref,
                contexts,
            },
        })
    }

    async fn run_operation(
        &self,
        op: &PreparedOperation,
    ) -> Result<OperationOutcome, OperationsError> {
        let PreparedData::BatchPin {
            batch,
            payload_ref,
            contexts,
        } = &op.data
        else {
            return Err(OperationsError::Store(StoreError::NotFound(
                "batch pin payload".into(),
            )));
        };
        let tx_id = batch.tx.id.ok_or_else(|| {
            OperationsError::Store(StoreError::NotFound("batch transaction".into()))
        })?;
        let batch_pin = BatchPin {
            tx_id,
            batch_id: batch.header.id,
            batch_hash: batch.hash,
            payload_ref: payload_ref.clone(),
            contexts: contexts.clone(),
        };
        self.blockchain
            .submit_batch_pin(&op.id, &batch.header.signer.key, &batch_pin)
            .await?;
        // Mining confirmation arrives via the blockchain receipt.
        Ok(OperationOutcome::pending())
    }
}

//! Private batch dispatch: blob transfer and batch send to each member
//! node, then pin submission for pinned batches.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use shared_connectors::DataExchangeConnector;
use shared_store::{hydrate_batch, Store, StoreError};
use shared_store::prelude::*;
use shared_types::{
    Blob, Bytes32, Identity, Operation, OpType, PreparedData, PreparedOperation, TransactionType,
    TransportWrapper,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::work::DispatchState;
use crate::error::BatchError;
use crate::service::manager::DispatchHandler;
use crate::service::pin_submitter::BatchPinSubmitter;
use wm_04_operations::{OperationHandler, OperationOutcome, OperationsError, OperationsManager};

/// Dispatch handler for private batches (pinned and unpinned). Also the
/// operation handler for the data-exchange send operations it creates.
pub struct PrivateBatchDispatcher {
    store: Arc<dyn Store>,
    operations: Arc<OperationsManager>,
    exchange: Arc<dyn DataExchangeConnector>,
    pin_submitter: Arc<BatchPinSubmitter>,
    local_node_did: String,
}

impl PrivateBatchDispatcher {
    /// Build the dispatcher; the caller registers it with the operation
    /// manager for the data-exchange operation types.
    pub fn new(
        store: Arc<dyn Store>,
        operations: Arc<OperationsManager>,
        exchange: Arc<dyn DataExchangeConnector>,
        pin_submitter: Arc<BatchPinSubmitter>,
        local_node_did: &str,
    ) -> Arc<Self> {
        Arc::new(PrivateBatchDispatcher {
            store,
            operations,
            exchange,
            pin_submitter,
            local_node_did: local_node_did.to_string(),
        })
    }

    async fn resolve_nodes(&self, group: &Bytes32) -> Result<Vec<Identity>, BatchError> {
        let group = self
            .store
            .get_group_by_hash(group)
            .await?
            .ok_or_else(|| BatchError::MissingDependency(format!("group {group}")))?;
        let mut nodes = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        for member in &group.members {
            if !seen.insert(member.node) {
                continue;
            }
            let node = self
                .store
                .get_identity_by_id(&member.node)
                .await?
                .ok_or_else(|| BatchError::MissingDependency(format!("node {}", member.node)))?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn transfer_blobs(
        &self,
        state: &DispatchState,
        node: &Identity,
    ) -> Result<(), BatchError> {
        for record in &state.data {
            let Some(blob_ref) = &record.blob else {
                continue;
            };
            let blob = self
                .store
                .get_blob_matching_hash(&blob_ref.hash)
                .await?
                .ok_or_else(|| BatchError::MissingDependency(format!("blob {}", blob_ref.hash)))?;

            let mut op = Operation::new(
                &record.namespace,
                state.persisted.tx.id,
                OpType::DataExchangeSendBlob,
                self.exchange.name(),
            );
            op.input = serde_json::json!({
                "node": node.id.to_string(),
                "hash": blob.hash.to_string(),
            });
            self.operations.add_or_reuse_operation(&mut op).await?;
            debug!(blob = %blob.hash, data = %record.id, op = %op.id, node = %node.did, "Transferring blob");

            let prepared = PreparedOperation {
                id: op.id,
                op_type: OpType::DataExchangeSendBlob,
                data: PreparedData::SendBlob {
                    node: Box::new(node.clone()),
                    blob,
                },
            };
            self.operations.run_operation(prepared).await?;
        }
        Ok(())
    }

    async fn send_batch(
        &self,
        state: &DispatchState,
        wrapper: &TransportWrapper,
        node: &Identity,
    ) -> Result<(), BatchError> {
        let batch = &state.persisted;
        let mut op = Operation::new(
            &batch.header.namespace,
            batch.tx.id,
            OpType::DataExchangeSendBatch,
            self.exchange.name(),
        );
        op.input = serde_json::json!({
            "node": node.id.to_string(),
            "group": batch.header.group.map(|g| g.to_string()),
            "batch": batch.header.id.to_string(),
        });
        self.operations.add_or_reuse_operation(&mut op).await?;

        let prepared = PreparedOperation {
            id: op.id,
            op_type: OpType::DataExchangeSendBatch,
            data: PreparedData::SendBatch {
                node: Box::new(node.clone()),
                transport: Box::new(wrapper.clone()),
            },
        };
        self.operations.run_operation(prepared).await?;
        Ok(())
    }
}

#[async_trait]
impl DispatchHandler for PrivateBatchDispatcher {
    async fn dispatch(&self, state: &DispatchState) -> Result<(), BatchError> {
        let group_hash = state
            .persisted
            .header
            .group
            .ok_or_else(|| BatchError::MissingDependency("group hash".to_string()))?;
        let nodes = self.resolve_nodes(&group_hash).await?;
        let batch = state
            .persisted
            .hydrate(state.messages.clone(), state.data.clone());

        let mut wrapper = TransportWrapper { group: None, batch };
        if state.persisted.tx.tx_type == TransactionType::Unpinned {
            // Unpinned sends cannot assume the group was broadcast on-chain,
            // so the definition rides with every batch.
            wrapper.group = self.store.get_group_by_hash(&group_hash).await?;
        }

        let total = nodes.len();
        for (i, node) in nodes.iter().enumerate() {
            if node.did == self.local_node_did {
                debug!(
                    batch = %state.persisted.header.id,
                    node = %node.did,
                    "Skipping send to local node ({}/{})", i + 1, total
                );
                continue;
            }
            info!(
                batch = %state.persisted.header.id,
                group = %group_hash,
                node = %node.did,
                "Sending batch to node ({}/{})", i + 1, total
            );
            // Blobs first, so the payload is complete when the batch lands.
            self.transfer_blobs(state, node).await?;
            self.send_batch(state, &wrapper, node).await?;
        }

        if state.persisted.tx.tx_type == TransactionType::BatchPin {
            info!(
                batch = %state.persisted.header.id,
                group = %group_hash,
                "Pinning private batch"
            );
            self.pin_submitter.submit_pinned_batch(state, None).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for PrivateBatchDispatcher {
    fn name(&self) -> &str {
        "private_batch"
    }

    async fn prepare_operation(
        &self,
        op: &Operation,
    ) -> Result<PreparedOperation, OperationsError> {
        let node_id: Uuid = op
            .input
            .get("node")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| OperationsError::Store(StoreError::NotFound("node input".into())))?;
        let node = self
            .store
            .get_identity_by_id(&node_id)
            .await?
            .ok_or_else(|| OperationsError::Store(StoreError::NotFound(node_id.to_string())))?;

        match op.op_type {
            OpType::DataExchangeSendBlob => {
                let hash = op
                    .input
                    .get("hash")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Bytes32::from_hex(s).ok())
                    .ok_or_else(|| {
                        OperationsError::Store(StoreError::NotFound("hash input".into()))
                    })?;
                let blob: Blob = self
                    .store
                    .get_blob_matching_hash(&hash)
                    .await?
                    .ok_or_else(|| OperationsError::Store(StoreError::NotFound(hash.to_string())))?;
                Ok(PreparedOperation {
                    id: op.id,
                    op_type: op.op_type,
                    data: PreparedData::SendBlob {
                        node: Box::new(node),
                        blob,
                    },
                })
            }
            OpType::DataExchangeSendBatch => {
                let batch_id: Uuid = op
                    .input
                    .get("batch")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        OperationsError::Store(StoreError::NotFound("batch input".into()))
                    })?;
                let persisted = self
                    .store
                    .get_batch_by_id(&batch_id)
                    .await?
                    .ok_or_else(|| {
                        OperationsError::Store(StoreError::NotFound(batch_id.to_string()))
                    })?;
                let batch = hydrate_batch(self.store.as_ref(), &persisted)
                    .await?
                    .ok_or_else(|| {
                        OperationsError::Store(StoreError::NotFound(format!(
                            "batch {batch_id} payload"
                        )))
                    })?;
                let group = match persisted.header.group {
                    Some(hash) if persisted.tx.tx_type == TransactionType::Unpinned => {
                        self.store.get_group_by_hash(&hash).await?
                    }
                    _ => None,
                };
                Ok(PreparedOperation {
                    id: op.id,
                    op_type: op.op_type,
                    data: PreparedData::SendBatch {
                        node: Box::new(node),
                        transport: Box::new(TransportWrapper { group, batch }),
                    },
                })
            }
            other => Err(OperationsError::UnregisteredType(other)),
        }
    }

    async fn run_operation(
        &self,
        op: &PreparedOperation,
    ) -> Result<OperationOutcome, OperationsError> {
        match &op.data {
            PreparedData::SendBlob { node, blob } => {
                let peer = node.dx_peer().unwrap_or(&node.did);
                self.exchange
                    .transfer_blob(&op.id, peer, &blob.payload_ref)
                    .await?;
                Ok(OperationOutcome::pending())
            }
            PreparedData::SendBatch { node, transport } => {
                let peer = node.dx_peer().unwrap_or(&node.did);
                let payload = serde_json::to_vec(transport.as_ref()).map_err(|e| {
                    OperationsError::Store(StoreError::Serialization(e.to_string()))
                })?;
                self.exchange.send_message(&op.id, peer, &payload).await?;
                Ok(OperationOutcome::pending())
            }
            PreparedData::BatchPin { .. } => {
                Err(OperationsError::UnregisteredType(op.op_type))
            }
        }
    }
}

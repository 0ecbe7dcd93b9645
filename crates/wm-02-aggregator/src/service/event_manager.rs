//! Connector ingest: the inbound half of the aggregation pipeline.
//!
//! Receives callbacks from the blockchain, data-exchange and token
//! connectors, persists their payloads (pins, batches, blobs, transfers,
//! blockchain events) and wakes or rewinds the aggregator. Store failures
//! surface as transient connector errors so the connector redelivers;
//! malformed payloads are logged and swallowed, because redelivery cannot
//! repair them.

use std::sync::Arc;

use async_trait::async_trait;
use shared_connectors::{
    BlockchainCallbacks, ConnectorError, DataExchangeCallbacks, TokenCallbacks,
    TokenPoolAnnouncement, TransferStatus,
};
use shared_store::{Store, StoreError};
use shared_store::prelude::*;
use shared_types::{
    BatchPersisted, BatchPin, Blob, BlockchainEvent, Bytes32, Event, EventType, Group,
    MessageState, OpStatus, Pin, TokenTransfer, TransportWrapper, VerifierRef,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ports::outbound::OperationUpdater;
use crate::service::aggregator::Aggregator;

fn transient(e: StoreError) -> ConnectorError {
    ConnectorError::Network(e.to_string())
}

/// The connector-facing event manager.
pub struct EventManager {
    store: Arc<dyn Store>,
    aggregator: Arc<Aggregator>,
    operations: Arc<dyn OperationUpdater>,
}

impl EventManager {
    /// Build the event manager.
    pub fn new(
        store: Arc<dyn Store>,
        aggregator: Arc<Aggregator>,
        operations: Arc<dyn OperationUpdater>,
    ) -> Arc<Self> {
        Arc::new(EventManager {
            store,
            aggregator,
            operations,
        })
    }

    /// Validate and persist an off-chain batch, returning its id when
    /// accepted.
    async fn persist_batch(&self, wrapper: &TransportWrapper) -> Result<Option<Uuid>, StoreError> {
        let batch = &wrapper.batch;
        if batch.payload.messages.is_empty() {
            warn!(batch = %batch.header.id, "Received batch with no messages; discarding");
            return Ok(None);
        }

        // The persisted manifest must hash to exactly what the sender
        // committed to; anything else is a forgery or corruption.
        let (persisted, _manifest) = match BatchPersisted::seal(
            batch.header.clone(),
            batch.payload.tx.clone(),
            &batch.payload.messages,
            &batch.payload.data,
        ) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(batch = %batch.header.id, error = %e, "Received unserializable batch; discarding");
                return Ok(None);
            }
        };
        if persisted.hash != batch.hash {
            warn!(
                batch = %batch.header.id,
                declared = %batch.hash,
                computed = %persisted.hash,
                "Received batch hash does not match its payload; discarding"
            );
            return Ok(None);
        }

        if let Some(group) = &wrapper.group {
            let computed =
                Group::compute_hash(&group.namespace, group.name.as_deref(), &group.members);
            if computed != group.hash {
                warn!(group = %group.hash, "Received group hash does not match its definition; discarding");
                return Ok(None);
            }
        }

        let batch_id = batch.header.id;
        let wrapper = wrapper.clone();
        let persisted_batch = persisted;
        self.store
            .run_as_group(Box::new(move |s| {
                Box::pin(async move {
                    if let Some(group) = &wrapper.group {
                        s.upsert_group(group).await?;
                    }
                    s.upsert_batch(&persisted_batch).await?;

                    let mut messages = wrapper.batch.payload.messages.clone();
                    for message in messages.iter_mut() {
                        message.batch = Some(batch_id);
                        message.state = MessageState::Pending;
                        message.confirmed = None;
                    }
                    // Fast path batch insert; fall back per-row when any
                    // message was already delivered another way.
                    if s.insert_messages(&mut messages).await.is_err() {
                        for message in messages.iter_mut() {
                            if let Err(e) = s.upsert_message(message).await {
                                warn!(message = %message.header.id, error = %e, "Message upsert failed");
                            }
                        }
                    }
                    if s.insert_data_array(&wrapper.batch.payload.data).await.is_err() {
                        for record in &wrapper.batch.payload.data {
                            if let Err(e) = s.upsert_data(record).await {
                                warn!(data = %record.id, error = %e, "Data upsert failed");
                            }
                        }
                    }
                    Ok(())
                })
            }))
            .await?;

        Ok(Some(batch_id))
    }
}

#[async_trait]
impl BlockchainCallbacks for EventManager {
    async fn batch_pin_complete(
        &self,
        batch_pin: BatchPin,
        signer: VerifierRef,
    ) -> Result<(), ConnectorError> {
        info!(
            batch = %batch_pin.batch_id,
            contexts = batch_pin.contexts.len(),
            signer = %signer.value,
            "Batch pin complete"
        );
        // Broadcast pins carry a shared-storage payload ref; private pins
        // have none and their contexts are masked.
        let masked = batch_pin.payload_ref.is_none();
        for (index, context) in batch_pin.contexts.iter().enumerate() {
            let mut pin = Pin {
                sequence: 0,
                masked,
                hash: *context,
                batch: batch_pin.batch_id,
                batch_hash: batch_pin.batch_hash,
                index: index as i64,
                signer: signer.value.clone(),
                dispatched: false,
                created: shared_types::now(),
            };
            self.store.upsert_pin(&mut pin).await.map_err(transient)?;
        }
        self.aggregator.shoulder_tap().tap();
        Ok(())
    }

    async fn blockchain_event(&self, mut event: BlockchainEvent) -> Result<(), ConnectorError> {
        let existing = self
            .store
            .get_blockchain_event_by_protocol_id(event.listener.as_ref(), &event.protocol_id)
            .await
            .map_err(transient)?;
        if let Some(existing) = existing {
            debug!(
                protocol_id = %event.protocol_id,
                existing = %existing.id,
                "Duplicate blockchain event suppressed"
            );
            return Ok(());
        }

        let namespace = event.namespace.clone();
        let reference = event.id;
        self.store
            .insert_blockchain_event(&mut event)
            .await
            .map_err(transient)?;
        let mut app_event =
            Event::new(EventType::BlockchainEventReceived, &namespace, reference, event.tx, None);
        self.store
            .insert_event(&mut app_event)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn operation_update(
        &self,
        op_id: Uuid,
        status: OpStatus,
        tx_hash: Option<String>,
        error: Option<String>,
        info: serde_json::Value,
    ) -> Result<(), ConnectorError> {
        debug!(op = %op_id, ?status, tx_hash = tx_hash.as_deref().unwrap_or_default(), "Blockchain operation update");
        self.operations
            .submit_operation_update(op_id, status, error, info)
            .await
            .map_err(transient)
    }
}

#[async_trait]
impl DataExchangeCallbacks for EventManager {
    async fn message_received(
        &self,
        peer_id: &str,
        payload: &[u8],
    ) -> Result<Option<String>, ConnectorError> {
        let wrapper: TransportWrapper = match serde_json::from_slice(payload) {
            Ok(wrapper) => wrapper,
            Err(e) => {
                warn!(peer = peer_id, error = %e, "Undeserializable transport payload; discarding");
                return Ok(None);
            }
        };
        debug!(
            peer = peer_id,
            batch = %wrapper.batch.header.id,
            messages = wrapper.batch.payload.messages.len(),
            "Batch received over data exchange"
        );

        let persisted = self.persist_batch(&wrapper).await.map_err(transient)?;
        let Some(batch_id) = persisted else {
            return Ok(None);
        };

        // Any pins already parked for this batch can now complete.
        self.aggregator.queue_batch_rewind(batch_id).await;
        Ok(Some(batch_id.to_string()))
    }

    async fn private_blob_received(
        &self,
        peer_id: &str,
        hash: Bytes32,
        size: i64,
        payload_ref: &str,
    ) -> Result<(), ConnectorError> {
        info!(peer = peer_id, blob = %hash, size, "Private blob received");
        let mut blob = Blob {
            hash,
            payload_ref: payload_ref.to_string(),
            size,
            created: shared_types::now(),
            sequence: 0,
        };
        self.store.insert_blob(&mut blob).await.map_err(transient)?;
        self.aggregator
            .rewind_for_blob_arrival(&hash)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn transfer_result(
        &self,
        tracking_id: &str,
        status: TransferStatus,
        info: serde_json::Value,
    ) -> Result<(), ConnectorError> {
        // Data-exchange transfers are tracked by their operation id.
        let Ok(op_id) = tracking_id.parse::<Uuid>() else {
            warn!(tracking_id, "Transfer result with unparseable tracking id");
            return Ok(());
        };
        let (status, error) = match status {
            TransferStatus::Succeeded => (OpStatus::Succeeded, None),
            TransferStatus::Failed => (
                OpStatus::Failed,
                Some(
                    info.get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("transfer failed")
                        .to_string(),
                ),
            ),
        };
        self.operations
            .submit_operation_update(op_id, status, error, info)
            .await
            .map_err(transient)
    }
}

#[async_trait]
impl TokenCallbacks for EventManager {
    async fn token_pool_created(
        &self,
        connector: &str,
        announcement: TokenPoolAnnouncement,
    ) -> Result<(), ConnectorError> {
        let pool = self
            .store
            .get_token_pool_by_id(&announcement.pool_id)
            .await
            .map_err(transient)?;
        match pool {
            Some(mut pool) => {
                pool.protocol_id = announcement.protocol_id;
                self.store.upsert_token_pool(&pool).await.map_err(transient)?;
                info!(pool = %pool.id, connector, "Token pool confirmed");
            }
            None => {
                debug!(pool = %announcement.pool_id, connector, "Pool announcement for unknown pool ignored");
            }
        }
        Ok(())
    }

    async fn tokens_transferred(
        &self,
        connector: &str,
        transfer: TokenTransfer,
    ) -> Result<(), ConnectorError> {
        let Some(pool) = self
            .store
            .get_token_pool_by_id(&transfer.pool)
            .await
            .map_err(transient)?
        else {
            warn!(pool = %transfer.pool, connector, "Transfer for unknown pool; discarding");
            return Ok(());
        };
        if pool.connector != connector {
            warn!(
                pool = %pool.id,
                expected = %pool.connector,
                connector,
                "Transfer delivered by wrong connector; discarding"
            );
            return Ok(());
        }

        // Protocol ids are only unique within one connector's pool, so the
        // suppression key is (pool, protocol id) with the connector already
        // pinned by the pool row.
        let duplicate = self
            .store
            .get_token_transfer_by_protocol_id(&transfer.pool, &transfer.protocol_id)
            .await
            .map_err(transient)?;
        if let Some(duplicate) = duplicate {
            debug!(
                protocol_id = %transfer.protocol_id,
                existing = %duplicate.id,
                "Duplicate token transfer suppressed"
            );
            return Ok(());
        }

        self.store
            .insert_token_transfer(&transfer)
            .await
            .map_err(transient)?;
        let mut event = Event::new(
            EventType::TransferConfirmed,
            &pool.namespace,
            transfer.id,
            transfer.tx,
            Some(pool.id.to_string()),
        );
        self.store.insert_event(&mut event).await.map_err(transient)?;

        // A transfer that names a message may unblock that message's batch.
        if let Some(message_id) = transfer.message {
            let message = self
                .store
                .get_message_by_id(&message_id)
                .await
                .map_err(transient)?;
            if let Some(batch) = message.and_then(|m| m.batch) {
                self.aggregator.queue_batch_rewind(batch).await;
            }
        }
        Ok(())
    }

    async fn token_op_update(
        &self,
        op_id: Uuid,
        status: OpStatus,
        error: Option<String>,
        info: serde_json::Value,
    ) -> Result<(), ConnectorError> {
        if status == OpStatus::Failed {
            error!(op = %op_id, error = error.as_deref().unwrap_or_default(), "Token operation failed");
        }
        self.operations
            .submit_operation_update(op_id, status, error, info)
            .await
            .map_err(transient)
    }
}

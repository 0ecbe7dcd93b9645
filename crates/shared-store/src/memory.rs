//! In-memory reference store.
//!
//! Backs tests and single-process deployments. Every operation takes the one
//! inner lock briefly and never awaits while holding it, so individual
//! mutations are atomic and sequence allocation is race-free. A transactional
//! group executes its closure sequentially against the same store; the
//! in-memory adapter does not attempt rollback (production adapters supply
//! real transactions behind the same port).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{
    BatchPersisted, Blob, BlockchainEvent, Bytes32, Data, DataRef, Datatype, Event, Group,
    Identity, IdentityType, Message, MessageState, NextPin, Nonce, Offset, Operation, OpStatus,
    Pin, Subscription, Timestamp, TokenPool, TokenTransfer, Transaction, Verifier, VerifierRef,
    VerifierType,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::changes::{ChangeEvent, Collection};
use crate::error::StoreError;
use crate::ports::*;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    messages: HashMap<Uuid, Message>,
    message_seq: i64,
    data: HashMap<Uuid, Data>,
    blobs: HashMap<Bytes32, Blob>,
    blob_seq: i64,
    batches: HashMap<Uuid, BatchPersisted>,
    transactions: HashMap<Uuid, Transaction>,
    datatypes: HashMap<(String, String, String), Datatype>,
    offsets: HashMap<String, Offset>,
    offset_row_seq: i64,
    pins: BTreeMap<i64, Pin>,
    pin_seq: i64,
    events: BTreeMap<i64, Event>,
    event_seq: i64,
    operations: HashMap<Uuid, Operation>,
    subscriptions: HashMap<Uuid, Subscription>,
    identities: HashMap<Uuid, Identity>,
    verifiers: HashMap<(VerifierType, String, String), Verifier>,
    groups: HashMap<Bytes32, Group>,
    nonces: HashMap<Bytes32, Nonce>,
    next_pins: BTreeMap<i64, NextPin>,
    next_pin_seq: i64,
    token_pools: HashMap<Uuid, TokenPool>,
    token_transfers: Vec<TokenTransfer>,
    blockchain_events: BTreeMap<i64, BlockchainEvent>,
    blockchain_event_seq: i64,
}

/// The in-memory store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Convenience constructor for consumers that hold `Arc<dyn Store>`.
    #[must_use]
    pub fn new_arc() -> Arc<dyn Store> {
        Arc::new(Self::new())
    }

    fn notify(&self, event: ChangeEvent) {
        // Lossy on purpose: nobody listening, or a lagging listener, is fine.
        let _ = self.changes.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageCollection for MemoryStore {
    async fn upsert_message(&self, message: &mut Message) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.messages.get(&message.header.id) {
                if existing.hash != message.hash {
                    return Err(StoreError::HashMismatch(message.header.id.to_string()));
                }
                message.sequence = existing.sequence;
            } else {
                inner.message_seq += 1;
                message.sequence = inner.message_seq;
            }
            inner.messages.insert(message.header.id, message.clone());
        }
        self.notify(ChangeEvent::created(
            Collection::Messages,
            message.header.id,
            Some(message.sequence),
        ));
        Ok(())
    }

    async fn insert_messages(&self, messages: &mut [Message]) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            for message in messages.iter() {
                if inner.messages.contains_key(&message.header.id) {
                    return Err(StoreError::Conflict(message.header.id.to_string()));
                }
            }
            for message in messages.iter_mut() {
                inner.message_seq += 1;
                message.sequence = inner.message_seq;
                inner.messages.insert(message.header.id, message.clone());
            }
        }
        for message in messages.iter() {
            self.notify(ChangeEvent::created(
                Collection::Messages,
                message.header.id,
                Some(message.sequence),
            ));
        }
        Ok(())
    }

    async fn replace_message(&self, message: &mut Message) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.message_seq += 1;
            message.sequence = inner.message_seq;
            inner.messages.insert(message.header.id, message.clone());
        }
        self.notify(ChangeEvent::created(
            Collection::Messages,
            message.header.id,
            Some(message.sequence),
        ));
        Ok(())
    }

    async fn update_message_state(
        &self,
        id: &Uuid,
        state: MessageState,
        confirmed: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let message = inner
                .messages
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            message.state = state;
            if confirmed.is_some() {
                message.confirmed = confirmed;
            }
        }
        self.notify(ChangeEvent::updated(Collection::Messages, *id));
        Ok(())
    }

    async fn update_messages_batch(
        &self,
        ids: &[Uuid],
        batch: Uuid,
        state: MessageState,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            for id in ids {
                let message = inner
                    .messages
                    .get_mut(id)
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                message.batch = Some(batch);
                message.state = state;
            }
        }
        for id in ids {
            self.notify(ChangeEvent::updated(Collection::Messages, *id));
        }
        Ok(())
    }

    async fn update_message_pins(&self, id: &Uuid, pins: &[String]) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let message = inner
                .messages
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            message.pins = pins.to_vec();
        }
        self.notify(ChangeEvent::updated(Collection::Messages, *id));
        Ok(())
    }

    async fn get_message_by_id(&self, id: &Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.lock().messages.get(id).cloned())
    }

    async fn get_messages_by_id(&self, ids: &[Uuid]) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }

    async fn get_messages_for_data(
        &self,
        data_id: &Uuid,
        unconfirmed_only: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.data.iter().any(|d| d.id == *data_id))
            .filter(|m| !unconfirmed_only || m.confirmed.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|m| m.sequence);
        Ok(out)
    }
}

#[async_trait]
impl DataCollection for MemoryStore {
    async fn upsert_data(&self, data: &Data) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.data.get(&data.id) {
                if existing.hash != data.hash {
                    return Err(StoreError::HashMismatch(data.id.to_string()));
                }
            }
            inner.data.insert(data.id, data.clone());
        }
        self.notify(ChangeEvent::created(Collection::Data, data.id, None));
        Ok(())
    }

    async fn insert_data_array(&self, data: &[Data]) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            for record in data {
                if inner.data.contains_key(&record.id) {
                    return Err(StoreError::Conflict(record.id.to_string()));
                }
            }
            for record in data {
                inner.data.insert(record.id, record.clone());
            }
        }
        for record in data {
            self.notify(ChangeEvent::created(Collection::Data, record.id, None));
        }
        Ok(())
    }

    async fn get_data_by_id(&self, id: &Uuid) -> Result<Option<Data>, StoreError> {
        Ok(self.inner.lock().data.get(id).cloned())
    }

    async fn get_data_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Data>, StoreError> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.data.get(id).cloned())
            .collect())
    }

    async fn get_data_refs_for_blob(&self, hash: &Bytes32) -> Result<Vec<DataRef>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .values()
            .filter(|d| d.blob.as_ref().is_some_and(|b| b.hash == *hash))
            .map(|d| DataRef {
                id: d.id,
                hash: d.hash,
            })
            .collect())
    }
}

#[async_trait]
impl BlobCollection for MemoryStore {
    async fn insert_blob(&self, blob: &mut Blob) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.blob_seq += 1;
            blob.sequence = inner.blob_seq;
            inner.blobs.insert(blob.hash, blob.clone());
        }
        self.notify(ChangeEvent::created_hash(Collection::Blobs, blob.hash));
        Ok(())
    }

    async fn get_blob_matching_hash(&self, hash: &Bytes32) -> Result<Option<Blob>, StoreError> {
        Ok(self.inner.lock().blobs.get(hash).cloned())
    }
}

#[async_trait]
impl BatchCollection for MemoryStore {
    async fn upsert_batch(&self, batch: &BatchPersisted) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.batches.get(&batch.header.id) {
                if existing.hash != batch.hash {
                    return Err(StoreError::HashMismatch(batch.header.id.to_string()));
                }
            }
            inner.batches.insert(batch.header.id, batch.clone());
        }
        self.notify(ChangeEvent::created(
            Collection::Batches,
            batch.header.id,
            None,
        ));
        Ok(())
    }

    async fn get_batch_by_id(&self, id: &Uuid) -> Result<Option<BatchPersisted>, StoreError> {
        Ok(self.inner.lock().batches.get(id).cloned())
    }
}

#[async_trait]
impl TransactionCollection for MemoryStore {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.transactions.contains_key(&tx.id) {
                return Err(StoreError::Conflict(tx.id.to_string()));
            }
            inner.transactions.insert(tx.id, tx.clone());
        }
        self.notify(ChangeEvent::created(Collection::Transactions, tx.id, None));
        Ok(())
    }

    async fn get_transaction_by_id(&self, id: &Uuid) -> Result<Option<Transaction>, StoreError> {
        Ok(self.inner.lock().transactions.get(id).cloned())
    }
}

#[async_trait]
impl DatatypeCollection for MemoryStore {
    async fn upsert_datatype(&self, datatype: &Datatype) -> Result<(), StoreError> {
        let key = (
            datatype.namespace.clone(),
            datatype.name.clone(),
            datatype.version.clone(),
        );
        self.inner.lock().datatypes.insert(key, datatype.clone());
        self.notify(ChangeEvent::created(
            Collection::Datatypes,
            datatype.id,
            None,
        ));
        Ok(())
    }

    async fn get_datatype_by_name(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Datatype>, StoreError> {
        let key = (
            namespace.to_string(),
            name.to_string(),
            version.to_string(),
        );
        Ok(self.inner.lock().datatypes.get(&key).cloned())
    }
}

#[async_trait]
impl OffsetCollection for MemoryStore {
    async fn upsert_offset(&self, offset: &mut Offset) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.offsets.get(&offset.name) {
            offset.row_id = existing.row_id;
        } else {
            inner.offset_row_seq += 1;
            offset.row_id = inner.offset_row_seq;
        }
        inner.offsets.insert(offset.name.clone(), offset.clone());
        Ok(())
    }

    async fn get_offset(&self, name: &str) -> Result<Option<Offset>, StoreError> {
        Ok(self.inner.lock().offsets.get(name).cloned())
    }

    async fn update_offset(&self, row_id: i64, current: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let offset = inner
            .offsets
            .values_mut()
            .find(|o| o.row_id == row_id)
            .ok_or_else(|| StoreError::NotFound(format!("offset row {row_id}")))?;
        offset.current = current;
        Ok(())
    }

    async fn delete_offset(&self, name: &str) -> Result<(), StoreError> {
        self.inner.lock().offsets.remove(name);
        Ok(())
    }
}

#[async_trait]
impl PinCollection for MemoryStore {
    async fn insert_pins(&self, pins: &mut [Pin]) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            for pin in pins.iter() {
                let exists = inner
                    .pins
                    .values()
                    .any(|p| p.batch == pin.batch && p.hash == pin.hash && p.index == pin.index);
                if exists {
                    return Err(StoreError::Conflict(format!(
                        "pin {}/{}/{}",
                        pin.batch, pin.hash, pin.index
                    )));
                }
            }
            for pin in pins.iter_mut() {
                inner.pin_seq += 1;
                pin.sequence = inner.pin_seq;
                inner.pins.insert(pin.sequence, pin.clone());
            }
        }
        for pin in pins.iter() {
            self.notify(ChangeEvent::created(
                Collection::Pins,
                pin.batch,
                Some(pin.sequence),
            ));
        }
        Ok(())
    }

    async fn upsert_pin(&self, pin: &mut Pin) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner
                .pins
                .values()
                .find(|p| p.batch == pin.batch && p.hash == pin.hash && p.index == pin.index)
            {
                pin.sequence = existing.sequence;
                return Ok(());
            }
            inner.pin_seq += 1;
            pin.sequence = inner.pin_seq;
            inner.pins.insert(pin.sequence, pin.clone());
        }
        self.notify(ChangeEvent::created(
            Collection::Pins,
            pin.batch,
            Some(pin.sequence),
        ));
        Ok(())
    }

    async fn get_pins_after(
        &self,
        after: i64,
        limit: usize,
        undispatched_only: bool,
    ) -> Result<Vec<Pin>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .pins
            .range(after + 1..)
            .map(|(_, p)| p)
            .filter(|p| !undispatched_only || !p.dispatched)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn earliest_undispatched_pin(
        &self,
        batches: &[Uuid],
    ) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .pins
            .values()
            .filter(|p| !p.dispatched && batches.contains(&p.batch))
            .map(|p| p.sequence)
            .min())
    }

    async fn earliest_undispatched_pin_for_context(
        &self,
        hash: &Bytes32,
        before_sequence: i64,
    ) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .pins
            .values()
            .filter(|p| !p.dispatched && p.hash == *hash && p.sequence < before_sequence)
            .map(|p| p.sequence)
            .min())
    }

    async fn latest_pin_sequence(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().pin_seq)
    }

    async fn set_pins_dispatched(&self, batch: &Uuid, indexes: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for pin in inner.pins.values_mut() {
            if pin.batch == *batch && indexes.contains(&pin.index) {
                pin.dispatched = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventCollection for MemoryStore {
    async fn insert_event(&self, event: &mut Event) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.event_seq += 1;
            event.sequence = inner.event_seq;
            inner.events.insert(event.sequence, event.clone());
        }
        self.notify(ChangeEvent::created(
            Collection::Events,
            event.id,
            Some(event.sequence),
        ));
        Ok(())
    }

    async fn get_events_after(&self, after: i64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .range(after + 1..)
            .map(|(_, e)| e.clone())
            .take(limit)
            .collect())
    }

    async fn get_event_by_id(&self, id: &Uuid) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.events.values().find(|e| e.id == *id).cloned())
    }

    async fn latest_event_sequence(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().event_seq)
    }
}

#[async_trait]
impl OperationCollection for MemoryStore {
    async fn insert_operation(&self, op: &Operation) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.operations.contains_key(&op.id) {
                return Err(StoreError::Conflict(op.id.to_string()));
            }
            inner.operations.insert(op.id, op.clone());
        }
        self.notify(ChangeEvent::created(Collection::Operations, op.id, None));
        Ok(())
    }

    async fn resolve_operation(
        &self,
        id: &Uuid,
        status: OpStatus,
        error: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let op = inner
                .operations
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            op.status = status;
            op.error = error;
            if output.is_some() {
                op.output = output;
            }
            op.updated = shared_types::now();
        }
        self.notify(ChangeEvent::updated(Collection::Operations, *id));
        Ok(())
    }

    async fn set_operation_retry(&self, id: &Uuid, successor: &Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let op = inner
            .operations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        op.retry = Some(*successor);
        Ok(())
    }

    async fn get_operation_by_id(&self, id: &Uuid) -> Result<Option<Operation>, StoreError> {
        Ok(self.inner.lock().operations.get(id).cloned())
    }

    async fn get_operations_for_tx(&self, tx: &Uuid) -> Result<Vec<Operation>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Operation> = inner
            .operations
            .values()
            .filter(|o| o.tx == Some(*tx))
            .cloned()
            .collect();
        out.sort_by_key(|o| o.created);
        Ok(out)
    }
}

#[async_trait]
impl SubscriptionCollection for MemoryStore {
    async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let name_clash = inner.subscriptions.values().any(|s| {
                s.namespace == sub.namespace && s.name == sub.name && s.id != sub.id
            });
            if name_clash {
                return Err(StoreError::Conflict(format!(
                    "{}:{}",
                    sub.namespace, sub.name
                )));
            }
            inner.subscriptions.insert(sub.id, sub.clone());
        }
        self.notify(ChangeEvent::created(Collection::Subscriptions, sub.id, None));
        Ok(())
    }

    async fn get_subscription_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .subscriptions
            .values()
            .find(|s| s.namespace == namespace && s.name == name)
            .cloned())
    }

    async fn get_subscription_by_id(
        &self,
        id: &Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.inner.lock().subscriptions.get(id).cloned())
    }

    async fn get_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<Subscription> = inner.subscriptions.values().cloned().collect();
        out.sort_by_key(|s| s.created);
        Ok(out)
    }

    async fn delete_subscription_by_id(&self, id: &Uuid) -> Result<(), StoreError> {
        self.inner.lock().subscriptions.remove(id);
        Ok(())
    }
}

#[async_trait]
impl IdentityCollection for MemoryStore {
    async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.inner.lock().identities.insert(identity.id, identity.clone());
        self.notify(ChangeEvent::created(
            Collection::Identities,
            identity.id,
            None,
        ));
        Ok(())
    }

    async fn get_identity_by_id(&self, id: &Uuid) -> Result<Option<Identity>, StoreError> {
        Ok(self.inner.lock().identities.get(id).cloned())
    }

    async fn get_identity_by_did(&self, did: &str) -> Result<Option<Identity>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.identities.values().find(|i| i.did == did).cloned())
    }

    async fn upsert_verifier(&self, verifier: &Verifier) -> Result<(), StoreError> {
        let key = (
            verifier.verifier.verifier_type,
            verifier.verifier.value.clone(),
            verifier.namespace.clone(),
        );
        self.inner.lock().verifiers.insert(key, verifier.clone());
        Ok(())
    }

    async fn find_identity_for_verifier(
        &self,
        types: &[IdentityType],
        namespace: &str,
        verifier: &VerifierRef,
    ) -> Result<Option<Identity>, StoreError> {
        let inner = self.inner.lock();
        let key = (
            verifier.verifier_type,
            verifier.value.clone(),
            namespace.to_string(),
        );
        let Some(row) = inner.verifiers.get(&key) else {
            return Ok(None);
        };
        Ok(inner
            .identities
            .get(&row.identity)
            .filter(|i| types.contains(&i.identity_type))
            .cloned())
    }
}

#[async_trait]
impl GroupCollection for MemoryStore {
    async fn upsert_group(&self, group: &Group) -> Result<(), StoreError> {
        self.inner.lock().groups.insert(group.hash, group.clone());
        self.notify(ChangeEvent::created_hash(Collection::Groups, group.hash));
        Ok(())
    }

    async fn get_group_by_hash(&self, hash: &Bytes32) -> Result<Option<Group>, StoreError> {
        Ok(self.inner.lock().groups.get(hash).cloned())
    }
}

#[async_trait]
impl NonceCollection for MemoryStore {
    async fn upsert_nonce_next(&self, nonce: &Nonce) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock();
        let allocated = match inner.nonces.get_mut(&nonce.context) {
            Some(existing) => {
                existing.nonce += 1;
                existing.nonce
            }
            None => {
                let mut row = nonce.clone();
                row.nonce = 0;
                inner.nonces.insert(row.context, row);
                0
            }
        };
        Ok(allocated)
    }

    async fn get_nonce(&self, context: &Bytes32) -> Result<Option<Nonce>, StoreError> {
        Ok(self.inner.lock().nonces.get(context).cloned())
    }
}

#[async_trait]
impl NextPinCollection for MemoryStore {
    async fn insert_next_pin(&self, next_pin: &mut NextPin) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.next_pin_seq += 1;
        next_pin.sequence = inner.next_pin_seq;
        inner.next_pins.insert(next_pin.sequence, next_pin.clone());
        Ok(())
    }

    async fn get_next_pins_for_context(
        &self,
        context: &Bytes32,
    ) -> Result<Vec<NextPin>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .next_pins
            .values()
            .filter(|np| np.context == *context)
            .cloned()
            .collect())
    }

    async fn update_next_pin(
        &self,
        sequence: i64,
        nonce: i64,
        hash: Bytes32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let row = inner
            .next_pins
            .get_mut(&sequence)
            .ok_or_else(|| StoreError::NotFound(format!("nextpin row {sequence}")))?;
        row.nonce = nonce;
        row.hash = hash;
        Ok(())
    }
}

#[async_trait]
impl BlockchainEventCollection for MemoryStore {
    async fn insert_blockchain_event(
        &self,
        event: &mut BlockchainEvent,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.blockchain_event_seq += 1;
            event.sequence = inner.blockchain_event_seq;
            inner.blockchain_events.insert(event.sequence, event.clone());
        }
        self.notify(ChangeEvent::created(
            Collection::BlockchainEvents,
            event.id,
            Some(event.sequence),
        ));
        Ok(())
    }

    async fn get_blockchain_event_by_protocol_id(
        &self,
        listener: Option<&Uuid>,
        protocol_id: &str,
    ) -> Result<Option<BlockchainEvent>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .blockchain_events
            .values()
            .find(|e| e.listener.as_ref() == listener && e.protocol_id == protocol_id)
            .cloned())
    }

    async fn get_blockchain_event_by_id(
        &self,
        id: &Uuid,
    ) -> Result<Option<BlockchainEvent>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .blockchain_events
            .values()
            .find(|e| e.id == *id)
            .cloned())
    }
}

#[async_trait]
impl TokenCollection for MemoryStore {
    async fn upsert_token_pool(&self, pool: &TokenPool) -> Result<(), StoreError> {
        self.inner.lock().token_pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn get_token_pool_by_id(&self, id: &Uuid) -> Result<Option<TokenPool>, StoreError> {
        Ok(self.inner.lock().token_pools.get(id).cloned())
    }

    async fn insert_token_transfer(&self, transfer: &TokenTransfer) -> Result<(), StoreError> {
        self.inner.lock().token_transfers.push(transfer.clone());
        self.notify(ChangeEvent::created(
            Collection::TokenTransfers,
            transfer.id,
            None,
        ));
        Ok(())
    }

    async fn get_token_transfer_by_protocol_id(
        &self,
        pool: &Uuid,
        protocol_id: &str,
    ) -> Result<Option<TokenTransfer>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .token_transfers
            .iter()
            .find(|t| t.pool == *pool && t.protocol_id == protocol_id)
            .cloned())
    }

    async fn get_token_transfers_for_message(
        &self,
        message: &Uuid,
    ) -> Result<Vec<TokenTransfer>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .token_transfers
            .iter()
            .filter(|t| t.message == Some(*message))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn run_as_group<'a>(&'a self, work: GroupWork<'a>) -> Result<(), StoreError> {
        // The in-memory adapter executes groups sequentially against itself;
        // nesting therefore trivially reuses the "transaction".
        work(self).await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

//! # Store Ports (Driven Ports)
//!
//! The narrow persistence interface the core depends on, split per
//! collection. Production adapters (SQL, NoSQL) implement these traits; the
//! in-memory reference adapter lives in `memory.rs`.
//!
//! Sequencing contract: `insert_*` on messages, pins, events and blobs
//! assigns a strictly increasing local sequence in insertion order, written
//! back into the passed record. Event sequences are additionally gapless over
//! successful inserts.

use async_trait::async_trait;
use futures::future::BoxFuture;
use shared_types::{
    Batch, BatchPersisted, Blob, BlockchainEvent, Bytes32, Data, DataRef, Datatype, Event, Group,
    Identity, IdentityType, Message, MessageState, NextPin, Nonce, Offset, Operation, OpStatus,
    Pin, Subscription, Timestamp, TokenPool, TokenTransfer, Transaction, Verifier, VerifierRef,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::changes::ChangeEvent;
use crate::error::StoreError;

/// Work executed inside a transactional group. The closure receives the
/// transactional view of the store; nested `run_as_group` calls reuse the
/// outer group.
pub type GroupWork<'a> =
    Box<dyn FnOnce(&'a dyn Store) -> BoxFuture<'a, Result<(), StoreError>> + Send + 'a>;

/// Message persistence.
#[async_trait]
pub trait MessageCollection: Send + Sync {
    /// Upsert a message. An existing row must carry the same hash, or the
    /// upsert fails with `HashMismatch`.
    async fn upsert_message(&self, message: &mut Message) -> Result<(), StoreError>;

    /// Batch insert of messages assured to be new. Fails with `Conflict` if
    /// any row exists, so the caller can fall back to per-row upsert.
    async fn insert_messages(&self, messages: &mut [Message]) -> Result<(), StoreError>;

    /// Re-enter a message at the head of the stream with a new sequence.
    async fn replace_message(&self, message: &mut Message) -> Result<(), StoreError>;

    /// Update one message's lifecycle state (and confirmed time when given).
    async fn update_message_state(
        &self,
        id: &Uuid,
        state: MessageState,
        confirmed: Option<Timestamp>,
    ) -> Result<(), StoreError>;

    /// Assign a set of messages to a batch, moving them to `state`.
    async fn update_messages_batch(
        &self,
        ids: &[Uuid],
        batch: Uuid,
        state: MessageState,
    ) -> Result<(), StoreError>;

    /// Persist the masked pins calculated for a private message at seal time.
    async fn update_message_pins(&self, id: &Uuid, pins: &[String]) -> Result<(), StoreError>;

    /// Get a message by id.
    async fn get_message_by_id(&self, id: &Uuid) -> Result<Option<Message>, StoreError>;

    /// Get several messages by id; missing ids are skipped.
    async fn get_messages_by_id(&self, ids: &[Uuid]) -> Result<Vec<Message>, StoreError>;

    /// Messages that reference a data record, optionally unconfirmed only.
    async fn get_messages_for_data(
        &self,
        data_id: &Uuid,
        unconfirmed_only: bool,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Data record persistence.
#[async_trait]
pub trait DataCollection: Send + Sync {
    /// Upsert a data record; hash immutability enforced as for messages.
    async fn upsert_data(&self, data: &Data) -> Result<(), StoreError>;

    /// Batch insert of records assured to be new; `Conflict` on any clash.
    async fn insert_data_array(&self, data: &[Data]) -> Result<(), StoreError>;

    /// Get a data record by id.
    async fn get_data_by_id(&self, id: &Uuid) -> Result<Option<Data>, StoreError>;

    /// Get several data records by id; missing ids are skipped.
    async fn get_data_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Data>, StoreError>;

    /// References to data records whose blob matches `hash`.
    async fn get_data_refs_for_blob(&self, hash: &Bytes32) -> Result<Vec<DataRef>, StoreError>;
}

/// Blob index persistence (payloads themselves live in the data-exchange
/// runtime; the store only records arrival).
#[async_trait]
pub trait BlobCollection: Send + Sync {
    /// Record a locally-available blob.
    async fn insert_blob(&self, blob: &mut Blob) -> Result<(), StoreError>;

    /// Find a blob by content hash.
    async fn get_blob_matching_hash(&self, hash: &Bytes32) -> Result<Option<Blob>, StoreError>;
}

/// Batch persistence.
#[async_trait]
pub trait BatchCollection: Send + Sync {
    /// Upsert a batch; the hash cannot change.
    async fn upsert_batch(&self, batch: &BatchPersisted) -> Result<(), StoreError>;

    /// Get a batch by id.
    async fn get_batch_by_id(&self, id: &Uuid) -> Result<Option<BatchPersisted>, StoreError>;
}

/// Transaction persistence.
#[async_trait]
pub trait TransactionCollection: Send + Sync {
    /// Insert a new transaction.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Get a transaction by id.
    async fn get_transaction_by_id(&self, id: &Uuid) -> Result<Option<Transaction>, StoreError>;
}

/// Datatype persistence.
#[async_trait]
pub trait DatatypeCollection: Send + Sync {
    /// Upsert a datatype definition.
    async fn upsert_datatype(&self, datatype: &Datatype) -> Result<(), StoreError>;

    /// Get a datatype by namespace, name and version.
    async fn get_datatype_by_name(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Datatype>, StoreError>;
}

/// Named poller cursors.
#[async_trait]
pub trait OffsetCollection: Send + Sync {
    /// Create or replace an offset row.
    async fn upsert_offset(&self, offset: &mut Offset) -> Result<(), StoreError>;

    /// Get an offset by name.
    async fn get_offset(&self, name: &str) -> Result<Option<Offset>, StoreError>;

    /// Commit a new cursor value by row id.
    async fn update_offset(&self, row_id: i64, current: i64) -> Result<(), StoreError>;

    /// Delete an offset by name (durable subscription teardown).
    async fn delete_offset(&self, name: &str) -> Result<(), StoreError>;
}

/// Pin persistence, with sequence allocation.
#[async_trait]
pub trait PinCollection: Send + Sync {
    /// Insert a list of pins, assigning sequences; `Conflict` if any exists.
    async fn insert_pins(&self, pins: &mut [Pin]) -> Result<(), StoreError>;

    /// Insert a pin at the end of the sequence unless the same
    /// (batch, hash, index) already exists.
    async fn upsert_pin(&self, pin: &mut Pin) -> Result<(), StoreError>;

    /// Pins with sequence strictly greater than `after`, ascending, capped at
    /// `limit`. `undispatched_only` filters out already-dispatched rows.
    async fn get_pins_after(
        &self,
        after: i64,
        limit: usize,
        undispatched_only: bool,
    ) -> Result<Vec<Pin>, StoreError>;

    /// The earliest undispatched pin sequence across a set of batches.
    async fn earliest_undispatched_pin(
        &self,
        batches: &[Uuid],
    ) -> Result<Option<i64>, StoreError>;

    /// The earliest undispatched pin on one context (pin hash) strictly
    /// before `before_sequence`; the cross-page topic-block check.
    async fn earliest_undispatched_pin_for_context(
        &self,
        hash: &Bytes32,
        before_sequence: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// The highest assigned pin sequence, or 0 when empty.
    async fn latest_pin_sequence(&self) -> Result<i64, StoreError>;

    /// Mark the given pin indexes of one batch dispatched.
    async fn set_pins_dispatched(&self, batch: &Uuid, indexes: &[i64]) -> Result<(), StoreError>;
}

/// Application event persistence, with gapless sequence allocation.
#[async_trait]
pub trait EventCollection: Send + Sync {
    /// Insert an event, assigning the next sequence. Sequences are strictly
    /// increasing and contiguous over successful inserts, in the order rows
    /// become visible to pollers.
    async fn insert_event(&self, event: &mut Event) -> Result<(), StoreError>;

    /// Events with sequence strictly greater than `after`, ascending, capped.
    async fn get_events_after(&self, after: i64, limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Get an event by id.
    async fn get_event_by_id(&self, id: &Uuid) -> Result<Option<Event>, StoreError>;

    /// The highest assigned event sequence, or 0 when empty.
    async fn latest_event_sequence(&self) -> Result<i64, StoreError>;
}

/// Operation persistence.
#[async_trait]
pub trait OperationCollection: Send + Sync {
    /// Insert an operation row.
    async fn insert_operation(&self, op: &Operation) -> Result<(), StoreError>;

    /// Resolve an operation on completion.
    async fn resolve_operation(
        &self,
        id: &Uuid,
        status: OpStatus,
        error: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Link a retried operation to its successor.
    async fn set_operation_retry(&self, id: &Uuid, successor: &Uuid) -> Result<(), StoreError>;

    /// Get an operation by id.
    async fn get_operation_by_id(&self, id: &Uuid) -> Result<Option<Operation>, StoreError>;

    /// All operations recorded for a transaction.
    async fn get_operations_for_tx(&self, tx: &Uuid) -> Result<Vec<Operation>, StoreError>;
}

/// Subscription persistence (durable subscriptions only).
#[async_trait]
pub trait SubscriptionCollection: Send + Sync {
    /// Upsert a subscription; names are unique per namespace.
    async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), StoreError>;

    /// Get a subscription by namespace and name.
    async fn get_subscription_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Get a subscription by id.
    async fn get_subscription_by_id(&self, id: &Uuid)
        -> Result<Option<Subscription>, StoreError>;

    /// All durable subscriptions.
    async fn get_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Delete a subscription by id.
    async fn delete_subscription_by_id(&self, id: &Uuid) -> Result<(), StoreError>;
}

/// Identity and verifier persistence.
#[async_trait]
pub trait IdentityCollection: Send + Sync {
    /// Upsert an identity.
    async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Get an identity by id.
    async fn get_identity_by_id(&self, id: &Uuid) -> Result<Option<Identity>, StoreError>;

    /// Get an identity by DID.
    async fn get_identity_by_did(&self, did: &str) -> Result<Option<Identity>, StoreError>;

    /// Upsert a verifier binding.
    async fn upsert_verifier(&self, verifier: &Verifier) -> Result<(), StoreError>;

    /// Resolve a verifier value to the identity it is registered to,
    /// restricted to the given identity types.
    async fn find_identity_for_verifier(
        &self,
        types: &[IdentityType],
        namespace: &str,
        verifier: &VerifierRef,
    ) -> Result<Option<Identity>, StoreError>;
}

/// Private group persistence.
#[async_trait]
pub trait GroupCollection: Send + Sync {
    /// Upsert a group definition.
    async fn upsert_group(&self, group: &Group) -> Result<(), StoreError>;

    /// Get a group by content hash.
    async fn get_group_by_hash(&self, hash: &Bytes32) -> Result<Option<Group>, StoreError>;
}

/// Outbound nonce allocation.
#[async_trait]
pub trait NonceCollection: Send + Sync {
    /// Atomically return the current nonce for a context and advance it.
    /// First-time contexts allocate and return 0.
    async fn upsert_nonce_next(&self, nonce: &Nonce) -> Result<i64, StoreError>;

    /// Read a nonce row without advancing it.
    async fn get_nonce(&self, context: &Bytes32) -> Result<Option<Nonce>, StoreError>;
}

/// Inbound next-pin expectations.
#[async_trait]
pub trait NextPinCollection: Send + Sync {
    /// Insert a next-pin row, assigning its row sequence.
    async fn insert_next_pin(&self, next_pin: &mut NextPin) -> Result<(), StoreError>;

    /// All next-pin rows for a context (one per group member).
    async fn get_next_pins_for_context(
        &self,
        context: &Bytes32,
    ) -> Result<Vec<NextPin>, StoreError>;

    /// Advance one row to a new nonce and hash, addressed by row sequence.
    async fn update_next_pin(
        &self,
        sequence: i64,
        nonce: i64,
        hash: Bytes32,
    ) -> Result<(), StoreError>;
}

/// Blockchain event persistence, with sequence allocation.
#[async_trait]
pub trait BlockchainEventCollection: Send + Sync {
    /// Insert a blockchain event, assigning the next sequence.
    async fn insert_blockchain_event(
        &self,
        event: &mut BlockchainEvent,
    ) -> Result<(), StoreError>;

    /// Duplicate-suppression lookup by listener and protocol id.
    async fn get_blockchain_event_by_protocol_id(
        &self,
        listener: Option<&Uuid>,
        protocol_id: &str,
    ) -> Result<Option<BlockchainEvent>, StoreError>;

    /// Get a blockchain event by id.
    async fn get_blockchain_event_by_id(
        &self,
        id: &Uuid,
    ) -> Result<Option<BlockchainEvent>, StoreError>;
}

/// Token pool and transfer persistence.
#[async_trait]
pub trait TokenCollection: Send + Sync {
    /// Upsert a token pool.
    async fn upsert_token_pool(&self, pool: &TokenPool) -> Result<(), StoreError>;

    /// Get a token pool by id.
    async fn get_token_pool_by_id(&self, id: &Uuid) -> Result<Option<TokenPool>, StoreError>;

    /// Insert a confirmed transfer.
    async fn insert_token_transfer(&self, transfer: &TokenTransfer) -> Result<(), StoreError>;

    /// Duplicate-suppression lookup by pool and connector protocol id.
    async fn get_token_transfer_by_protocol_id(
        &self,
        pool: &Uuid,
        protocol_id: &str,
    ) -> Result<Option<TokenTransfer>, StoreError>;

    /// Transfers recorded against a message.
    async fn get_token_transfers_for_message(
        &self,
        message: &Uuid,
    ) -> Result<Vec<TokenTransfer>, StoreError>;
}

/// The full store: every collection plus transactional groups and change
/// notifications. Nothing outside an adapter crate may name a concrete store
/// type; all consumers hold `Arc<dyn Store>`.
#[async_trait]
pub trait Store:
    MessageCollection
    + DataCollection
    + BlobCollection
    + BatchCollection
    + TransactionCollection
    + DatatypeCollection
    + OffsetCollection
    + PinCollection
    + EventCollection
    + OperationCollection
    + SubscriptionCollection
    + IdentityCollection
    + GroupCollection
    + NonceCollection
    + NextPinCollection
    + BlockchainEventCollection
    + TokenCollection
{
    /// Run `work` inside one transactional group. Calls nested inside an
    /// existing group reuse the outer transaction.
    async fn run_as_group<'a>(&'a self, work: GroupWork<'a>) -> Result<(), StoreError>;

    /// Subscribe to change notifications. Delivery is lossy; treat received
    /// events as wakeups only.
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Re-hydrate a persisted batch into its in-flight form by loading all of its
/// messages and data inside one read scope.
pub async fn hydrate_batch(
    store: &dyn Store,
    persisted: &BatchPersisted,
) -> Result<Option<Batch>, StoreError> {
    let Some(manifest) = persisted.extract_manifest() else {
        return Ok(None);
    };
    let message_ids: Vec<Uuid> = manifest.messages.iter().map(|m| m.id).collect();
    let data_ids: Vec<Uuid> = manifest.data.iter().map(|d| d.id).collect();
    let messages = store.get_messages_by_id(&message_ids).await?;
    let data = store.get_data_by_ids(&data_ids).await?;
    if messages.len() != message_ids.len() || data.len() != data_ids.len() {
        return Ok(None);
    }
    Ok(Some(persisted.hydrate(messages, data)))
}

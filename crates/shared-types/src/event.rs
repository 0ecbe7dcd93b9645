//! Application-facing events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{LocallySequenced, Timestamp};

/// What an event means, and what its `reference` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A transaction was submitted by this node.
    TransactionSubmitted,
    /// A message and all of its data is confirmed and available. The most
    /// important event type: most applications listen only to this.
    MessageConfirmed,
    /// A message was sequenced but rejected as invalid.
    MessageRejected,
    /// A new datatype is ready for use.
    DatatypeConfirmed,
    /// A new identity has been confirmed.
    IdentityConfirmed,
    /// A token transfer has been confirmed.
    TransferConfirmed,
    /// A token transfer submitted by this node failed at the connector.
    TransferOpFailed,
    /// An event arrived from a blockchain contract listener.
    BlockchainEventReceived,
}

/// An activity in the system, delivered reliably to applications in sequence
/// order. Insert-only; the store assigns a gapless, strictly increasing
/// sequence per successful insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique id.
    pub id: Uuid,
    /// Store-assigned delivery sequence.
    #[serde(skip)]
    pub sequence: i64,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Namespace.
    pub namespace: String,
    /// Id of the object this event refers to (message, transfer, ...).
    pub reference: Uuid,
    /// Application correlator (message CID, or handler-chosen id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlator: Option<Uuid>,
    /// Transaction this event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<Uuid>,
    /// Topic, for message events (one event per topic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Creation time.
    pub created: Timestamp,
}

impl Event {
    /// Build a new event with a fresh id; the sequence is assigned at insert.
    #[must_use]
    pub fn new(
        event_type: EventType,
        namespace: &str,
        reference: Uuid,
        tx: Option<Uuid>,
        topic: Option<String>,
    ) -> Self {
        Event {
            id: Uuid::new_v4(),
            sequence: 0,
            event_type,
            namespace: namespace.to_string(),
            reference,
            correlator: None,
            tx,
            topic,
            created: crate::now(),
        }
    }
}

impl LocallySequenced for Event {
    fn local_sequence(&self) -> i64 {
        self.sequence
    }
}

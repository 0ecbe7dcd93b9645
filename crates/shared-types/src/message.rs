//! Messages: the unit of application exchange.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::data::DataRef;
use crate::{LocallySequenced, Timestamp};

/// What kind of exchange a message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Broadcast visible to the whole network.
    Broadcast,
    /// Private message within a group.
    Private,
    /// System definition broadcast (datatypes, identities, ...).
    Definition,
    /// First message of a new private group, carrying the group definition.
    GroupInit,
    /// Broadcast that accompanies a token transfer.
    TransferBroadcast,
    /// Private message that accompanies a token transfer.
    TransferPrivate,
}

impl MessageType {
    /// True for the message types that travel with a token transfer and must
    /// not confirm until the matching transfer has been recorded.
    #[must_use]
    pub fn carries_transfer(&self) -> bool {
        matches!(
            self,
            MessageType::TransferBroadcast | MessageType::TransferPrivate
        )
    }
}

/// Message lifecycle state.
///
/// Transitions are monotone except `Ready -> Ready` (re-send after replace).
/// Only the aggregator sets `Confirmed`/`Rejected`; only the batch assembler
/// sets `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Inserted but not yet sendable (data still being attached).
    Staged,
    /// Eligible for batch assembly.
    Ready,
    /// Placed in a sealed batch and handed to the dispatcher.
    Sent,
    /// Received from the network, awaiting aggregation.
    Pending,
    /// Confirmed by the pin-ordered aggregator.
    Confirmed,
    /// Sequenced but rejected as invalid.
    Rejected,
}

/// The transaction type a message is anchored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// No transaction (unpinned data-exchange only).
    None,
    /// Anchored on the ledger via a batch pin.
    BatchPin,
    /// Sent off-chain without anchoring.
    Unpinned,
    /// A token transfer transaction.
    TokenTransfer,
}

/// Author identity plus the signing key it used.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignerRef {
    /// DID of the authoring identity.
    pub author: String,
    /// Signing key the pin is expected to carry.
    pub key: String,
}

/// Immutable message header. The header hash is part of the message hash, so
/// none of these fields may change after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Globally unique message id.
    pub id: Uuid,
    /// Correlation id chosen by the sender, echoed on confirm events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<Uuid>,
    /// Message type.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Transaction type used to anchor the batch this message rides in.
    pub tx_type: TransactionType,
    /// Author DID and signing key.
    #[serde(flatten)]
    pub signer: SignerRef,
    /// Creation time.
    pub created: Timestamp,
    /// Namespace this message lives in.
    pub namespace: String,
    /// Ordered, non-empty set of topics.
    pub topics: Vec<String>,
    /// Optional application tag (definition messages route on it).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Group hash for private messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Bytes32>,
    /// Hash of the data reference array.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<Bytes32>,
}

/// A message with its sequencing and lifecycle state.
///
/// For private messages `pins` is aligned 1:1 with `header.topics`; each entry
/// is a masked pin string of the form `HASH` or `HASH:NONCE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The immutable header.
    pub header: MessageHeader,
    /// Hash over header hash + data hash.
    pub hash: Bytes32,
    /// Batch this message was placed in (set when sealed or received).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<Uuid>,
    /// Lifecycle state.
    pub state: MessageState,
    /// Confirmation time, set exactly once by the aggregator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<Timestamp>,
    /// References to the data records in this message.
    pub data: Vec<DataRef>,
    /// Masked pins for private messages, aligned with `header.topics`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pins: Vec<String>,
    /// Store-assigned local sequence.
    #[serde(skip)]
    pub sequence: i64,
}

/// Fixed overhead assumed per message when estimating batch payload size.
pub const MESSAGE_SIZE_ESTIMATE_BASE: usize = 1024;

impl Message {
    /// Estimated serialized size for batch byte budgeting.
    ///
    /// Intentionally an over-estimate: the header base plus the declared size
    /// of every referenced data record.
    #[must_use]
    pub fn estimate_size(&self, data_value_sizes: usize) -> usize {
        MESSAGE_SIZE_ESTIMATE_BASE + data_value_sizes
    }

    /// Verify the topic/pin alignment invariant for private messages.
    #[must_use]
    pub fn pins_aligned(&self) -> bool {
        self.header.group.is_none() || self.pins.len() == self.header.topics.len()
    }
}

impl LocallySequenced for Message {
    fn local_sequence(&self) -> i64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MessageHeader {
        MessageHeader {
            id: Uuid::new_v4(),
            cid: None,
            msg_type: MessageType::Private,
            tx_type: TransactionType::BatchPin,
            signer: SignerRef {
                author: "did:weft:org/alpha".to_string(),
                key: "0xabc".to_string(),
            },
            created: crate::now(),
            namespace: "ns1".to_string(),
            topics: vec!["t1".to_string(), "t2".to_string()],
            tag: None,
            group: Some(Bytes32::new([7; 32])),
            data_hash: None,
        }
    }

    #[test]
    fn test_pin_alignment_checked_only_for_private() {
        let mut msg = Message {
            header: sample_header(),
            hash: Bytes32::default(),
            batch: None,
            state: MessageState::Pending,
            confirmed: None,
            data: vec![],
            pins: vec!["aa".repeat(32)],
            sequence: 0,
        };
        assert!(!msg.pins_aligned());

        msg.pins.push("bb".repeat(32));
        assert!(msg.pins_aligned());

        msg.header.group = None;
        msg.pins.clear();
        assert!(msg.pins_aligned());
    }

    #[test]
    fn test_transfer_types() {
        assert!(MessageType::TransferPrivate.carries_transfer());
        assert!(MessageType::TransferBroadcast.carries_transfer());
        assert!(!MessageType::Private.carries_transfer());
    }
}

//! Pins, next-pin expectations, nonces and poller offsets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::errors::ParseError;
use crate::{LocallySequenced, Timestamp};

/// An on-chain commitment to one (message, topic) pair within a batch.
///
/// Pins are the only input the aggregator orders on: the store assigns each a
/// strictly increasing local sequence at insert time, in ledger order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    /// Store-assigned local sequence; the aggregator's total order.
    #[serde(skip)]
    pub sequence: i64,
    /// True for private (masked) pins.
    pub masked: bool,
    /// Masked pin for private messages, or `H(topic)` for broadcast.
    pub hash: Bytes32,
    /// Batch carrying the pinned message.
    pub batch: Uuid,
    /// Hash the batch committed to on-chain; must match the stored batch.
    pub batch_hash: Bytes32,
    /// Index of this pin within the batch's pin sequence.
    pub index: i64,
    /// On-chain signing key that submitted the pin.
    pub signer: String,
    /// Set once the owning message has been confirmed or rejected.
    pub dispatched: bool,
    /// When the pin was recorded locally.
    pub created: Timestamp,
}

impl LocallySequenced for Pin {
    fn local_sequence(&self) -> i64 {
        self.sequence
    }
}

/// A parsed masked-pin string.
///
/// Messages carry their masked pins as `HASH` or `HASH:NONCE` strings; the
/// nonce suffix exists to aid debugging and is not required to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedPin {
    /// The masked pin hash.
    pub hash: Bytes32,
    /// The advisory nonce suffix, when present.
    pub nonce: Option<i64>,
}

impl MaskedPin {
    /// Parse a `HASH[:NONCE]` pin string.
    pub fn parse(pin: &str) -> Result<Self, ParseError> {
        let mut parts = pin.splitn(2, ':');
        let hash_part = parts.next().unwrap_or_default();
        let hash =
            Bytes32::from_hex(hash_part).map_err(|_| ParseError::InvalidPin(pin.to_string()))?;
        let nonce = match parts.next() {
            Some(n) => Some(
                n.parse::<i64>()
                    .map_err(|_| ParseError::InvalidPin(pin.to_string()))?,
            ),
            None => None,
        };
        Ok(MaskedPin { hash, nonce })
    }

    /// Render back to the `HASH:NONCE` debug form.
    #[must_use]
    pub fn to_pin_string(&self) -> String {
        match self.nonce {
            Some(n) => format!("{}:{}", self.hash, n),
            None => self.hash.to_string(),
        }
    }
}

/// This node's expectation of the next masked pin for one
/// `(context, identity)` pair. Exactly one row per pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextPin {
    /// `H(group || topic)`.
    pub context: Bytes32,
    /// Member identity DID.
    pub identity: String,
    /// Expected next masked pin hash.
    pub hash: Bytes32,
    /// Nonce the hash was derived from.
    pub nonce: i64,
    /// Store row sequence, used to address updates.
    #[serde(skip)]
    pub sequence: i64,
}

/// This node's latest allocated outbound nonce for a private context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nonce {
    /// `H(group || topic)`.
    pub context: Bytes32,
    /// Latest allocated nonce.
    pub nonce: i64,
    /// Group hash, retained so the context can be recomputed.
    pub group: Bytes32,
    /// Topic, retained so the context can be recomputed.
    pub topic: String,
}

/// A named poller cursor: the last local sequence fully processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offset {
    /// Cursor name (for example `wm_aggregator`, or a subscription id).
    pub name: String,
    /// Last processed sequence.
    pub current: i64,
    /// Store row id, used to address updates.
    #[serde(skip)]
    pub row_id: i64,
}

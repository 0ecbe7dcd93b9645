//! Wire framing for data-exchange payloads and batch pins.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::Batch;
use crate::bytes32::Bytes32;
use crate::identity::Group;

/// The JSON object sent over the private data-exchange channel.
///
/// The group definition is embedded only when the receiver cannot be assumed
/// to have seen it on-chain (unpinned sends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportWrapper {
    /// Group definition, embedded for unpinned sends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    /// The batch itself, with full payload.
    pub batch: Batch,
}

/// The payload of one on-chain batch-pin transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPin {
    /// Transaction id the batch was anchored with.
    pub tx_id: Uuid,
    /// Batch id.
    pub batch_id: Uuid,
    /// Hash the batch committed to.
    pub batch_hash: Bytes32,
    /// Shared-storage payload reference, for broadcast batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,
    /// Pin hashes in manifest order: masked pins for private batches,
    /// `H(topic)` for broadcast.
    pub contexts: Vec<Bytes32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchHeader, BatchPayload, BatchType, TransactionRef};
    use crate::message::{SignerRef, TransactionType};

    #[test]
    fn test_wrapper_omits_group_when_absent() {
        let wrapper = TransportWrapper {
            group: None,
            batch: Batch {
                header: BatchHeader {
                    id: Uuid::new_v4(),
                    batch_type: BatchType::Private,
                    namespace: "ns1".to_string(),
                    signer: SignerRef::default(),
                    group: Some(Bytes32::new([1; 32])),
                    created: 0,
                },
                payload: BatchPayload {
                    tx: TransactionRef {
                        tx_type: TransactionType::BatchPin,
                        id: None,
                    },
                    messages: vec![],
                    data: vec![],
                },
                hash: Bytes32::default(),
            },
        };

        let json = serde_json::to_value(&wrapper).unwrap();
        assert!(json.get("group").is_none());
        assert!(json.get("batch").is_some());
    }
}

//! Batches, manifests and transactions.
//!
//! A sealed batch is persisted with a compact, version-tagged *manifest*
//! rather than its full payload. The manifest carries just enough to
//! re-associate on-chain pins with messages: ordered `(id, topic-count)`
//! message entries plus the data id/hash list. Nodes that upgraded from the
//! legacy format still hold full-payload manifests; those are migrated in
//! place when read.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::data::{Data, DataRef};
use crate::errors::ParseError;
use crate::message::{Message, SignerRef, TransactionType};
use crate::Timestamp;

/// Current manifest version.
pub const MANIFEST_VERSION: u32 = 1;

/// Whether a batch is network-visible or group-private.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    /// Broadcast batch, payload published to shared storage.
    Broadcast,
    /// Private batch, payload transferred over data exchange.
    Private,
}

/// Reference to the transaction a batch is anchored with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    /// Transaction type.
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Transaction id, absent for unpinned sends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

/// A submitted transaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id, used as the correlator between batches and pins.
    pub id: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Transaction type.
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Creation time.
    pub created: Timestamp,
    /// On-chain ids reported back by the blockchain connector.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockchain_ids: Vec<String>,
}

/// Common batch fields shared by the persisted and in-flight forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHeader {
    /// Unique batch id.
    pub id: Uuid,
    /// Batch type.
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    /// Namespace.
    pub namespace: String,
    /// Author DID and signing key for the whole batch.
    #[serde(flatten)]
    pub signer: SignerRef,
    /// Group hash for private batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Bytes32>,
    /// Seal time.
    pub created: Timestamp,
}

/// One message entry in a manifest: the id plus how many pins (topics) the
/// message contributes to the batch's pin sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageManifestEntry {
    /// Message id.
    pub id: Uuid,
    /// Number of topics (and therefore pins) for this message.
    pub topics: usize,
}

/// Compact, versioned description of a batch's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    /// Manifest format version.
    pub version: u32,
    /// Batch id.
    pub id: Uuid,
    /// Anchoring transaction.
    pub tx: TransactionRef,
    /// Ordered message entries; order matches on-chain pin order.
    pub messages: Vec<MessageManifestEntry>,
    /// Data records by id and hash.
    pub data: Vec<DataRef>,
}

impl BatchManifest {
    /// Total number of pins this batch contributes on-chain.
    #[must_use]
    pub fn pin_count(&self) -> usize {
        self.messages.iter().map(|m| m.topics).sum()
    }

    /// Locate the message owning `index` in the batch's pin sequence, walking
    /// cumulative topic counts. Returns the entry and the base index of its
    /// first pin.
    #[must_use]
    pub fn entry_for_pin_index(&self, index: i64) -> Option<(&MessageManifestEntry, i64)> {
        let mut total: i64 = 0;
        for entry in &self.messages {
            let base = total;
            total += entry.topics as i64;
            if index < total && index >= base {
                return Some((entry, base));
            }
        }
        None
    }
}

/// The full payload of a batch: the anchoring transaction reference plus all
/// messages and data. This is what travels over data exchange, and what the
/// legacy manifest format persisted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPayload {
    /// Anchoring transaction.
    pub tx: TransactionRef,
    /// The messages, in pin order.
    pub messages: Vec<Message>,
    /// The data records referenced by the messages.
    pub data: Vec<Data>,
}

/// An in-flight batch: header plus full payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Common batch fields.
    #[serde(flatten)]
    pub header: BatchHeader,
    /// Full payload.
    pub payload: BatchPayload,
    /// Hash of the batch manifest.
    pub hash: Bytes32,
}

/// A persisted batch: header, manifest string and content hash. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPersisted {
    /// Common batch fields.
    #[serde(flatten)]
    pub header: BatchHeader,
    /// Serialized manifest (modern compact form, or legacy full payload).
    pub manifest: String,
    /// Transaction reference.
    pub tx: TransactionRef,
    /// SHA-256 of the manifest string.
    pub hash: Bytes32,
}

/// Generate the version-1 manifest for a payload.
#[must_use]
pub fn generate_manifest(
    id: Uuid,
    tx: TransactionRef,
    messages: &[Message],
    data: &[Data],
) -> BatchManifest {
    BatchManifest {
        version: MANIFEST_VERSION,
        id,
        tx,
        messages: messages
            .iter()
            .map(|m| MessageManifestEntry {
                id: m.header.id,
                topics: m.header.topics.len(),
            })
            .collect(),
        data: data
            .iter()
            .map(|d| DataRef {
                id: d.id,
                hash: d.hash,
            })
            .collect(),
    }
}

/// SHA-256 of a serialized manifest; this is the batch hash committed to by
/// every pin of the batch.
#[must_use]
pub fn manifest_hash(manifest_json: &str) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(manifest_json.as_bytes());
    Bytes32::new(hasher.finalize().into())
}

impl BatchPersisted {
    /// Build the persisted form of a batch from its sealed payload.
    pub fn seal(
        header: BatchHeader,
        tx: TransactionRef,
        messages: &[Message],
        data: &[Data],
    ) -> Result<(Self, BatchManifest), ParseError> {
        let manifest = generate_manifest(header.id, tx.clone(), messages, data);
        let manifest_json = serde_json::to_string(&manifest)
            .map_err(|e| ParseError::Serialization(e.to_string()))?;
        let hash = manifest_hash(&manifest_json);
        Ok((
            BatchPersisted {
                header,
                manifest: manifest_json,
                tx,
                hash,
            },
            manifest,
        ))
    }

    /// Extract the manifest, migrating the legacy full-payload form in place.
    ///
    /// Returns `None` for documents that are neither a known manifest version
    /// nor a migratable legacy payload; the caller parks the pin.
    #[must_use]
    pub fn extract_manifest(&self) -> Option<BatchManifest> {
        #[derive(Deserialize)]
        struct VersionProbe {
            #[serde(default)]
            version: u32,
        }

        let probe: VersionProbe = serde_json::from_str(&self.manifest).ok()?;
        match probe.version {
            0 => self.migrate_legacy_manifest(),
            MANIFEST_VERSION => serde_json::from_str(&self.manifest).ok(),
            _ => None,
        }
    }

    /// Legacy persisted batches stored the full payload; regenerate the
    /// compact manifest from it.
    fn migrate_legacy_manifest(&self) -> Option<BatchManifest> {
        let payload: BatchPayload = serde_json::from_str(&self.manifest).ok()?;
        if payload.messages.is_empty() {
            return None;
        }
        Some(generate_manifest(
            self.header.id,
            payload.tx.clone(),
            &payload.messages,
            &payload.data,
        ))
    }

    /// Rebuild the in-flight form from this persisted batch plus re-hydrated
    /// messages and data.
    #[must_use]
    pub fn hydrate(&self, messages: Vec<Message>, data: Vec<Data>) -> Batch {
        Batch {
            header: self.header.clone(),
            payload: BatchPayload {
                tx: self.tx.clone(),
                messages,
                data,
            },
            hash: self.hash,
        }
    }
}

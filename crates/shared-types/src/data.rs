//! Data records, blobs and datatypes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::Timestamp;

/// Reference to a typed-schema validator for a data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatatypeRef {
    /// Datatype name within the namespace.
    pub name: String,
    /// Datatype version.
    pub version: String,
}

/// Reference from a data record to a content-addressed blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// SHA-256 of the blob content.
    pub hash: Bytes32,
    /// Size in bytes.
    pub size: i64,
    /// Original file name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Public storage payload reference, for broadcast attachments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
}

/// An immutable data record. Exactly one of `value` / `blob` carries content;
/// `hash` covers the value, or the blob hash when the value is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    /// Unique id.
    pub id: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Optional typed-schema validator reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator: Option<DatatypeRef>,
    /// Inline JSON value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Blob attachment reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    /// Content hash.
    pub hash: Bytes32,
    /// Creation time.
    pub created: Timestamp,
}

impl Data {
    /// Compute the content hash for a value/blob pair, per the rule that the
    /// hash covers the inline value, or the blob hash when there is no value.
    #[must_use]
    pub fn compute_hash(value: Option<&serde_json::Value>, blob: Option<&BlobRef>) -> Bytes32 {
        let mut hasher = Sha256::new();
        match (value, blob) {
            (Some(v), _) => hasher.update(v.to_string().as_bytes()),
            (None, Some(b)) => hasher.update(b.hash.as_bytes()),
            (None, None) => {}
        }
        Bytes32::new(hasher.finalize().into())
    }

    /// Estimated serialized size of the inline value, for batch budgeting.
    #[must_use]
    pub fn value_size(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.to_string().len())
    }
}

/// Compact reference to a data record, as embedded in messages and manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    /// Data record id.
    pub id: Uuid,
    /// Data content hash.
    pub hash: Bytes32,
}

/// A locally-held binary payload, content-addressed by hash. Arrival is
/// asynchronous relative to the messages that reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    /// SHA-256 of the content.
    pub hash: Bytes32,
    /// Where the data-exchange runtime stored the payload locally.
    pub payload_ref: String,
    /// Size in bytes.
    pub size: i64,
    /// When the blob became available locally.
    pub created: Timestamp,
    /// Store-assigned local sequence.
    #[serde(skip)]
    pub sequence: i64,
}

/// A named, versioned schema that typed data records validate against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datatype {
    /// Unique id.
    pub id: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Name, unique with version inside the namespace.
    pub name: String,
    /// Version string.
    pub version: String,
    /// The schema document itself.
    pub value: serde_json::Value,
    /// Hash of the schema document.
    pub hash: Bytes32,
    /// Creation time.
    pub created: Timestamp,
}

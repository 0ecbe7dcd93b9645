//! Identities, verifiers and private groups.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bytes32::Bytes32;
use crate::Timestamp;

/// Kinds of registered identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    /// An organization.
    Org,
    /// A node operated by an organization.
    Node,
    /// A custom application identity.
    Custom,
}

/// A registered identity in the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Unique id.
    pub id: Uuid,
    /// Decentralized identifier, e.g. `did:weft:org/alpha`.
    pub did: String,
    /// Identity type.
    #[serde(rename = "type")]
    pub identity_type: IdentityType,
    /// Parent identity (a node's owning org).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    /// Namespace.
    pub namespace: String,
    /// Display name.
    pub name: String,
    /// Transport profile (data-exchange peer id, endpoints).
    #[serde(default)]
    pub profile: serde_json::Value,
    /// Registration time.
    pub created: Timestamp,
}

impl Identity {
    /// The data-exchange peer id from the transport profile, if set.
    #[must_use]
    pub fn dx_peer(&self) -> Option<&str> {
        self.profile.get("id").and_then(|v| v.as_str())
    }
}

/// Kinds of cryptographic verifier bound to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierType {
    /// An Ethereum-style account address.
    EthAddress,
    /// A generic data-exchange peer identifier.
    DxPeerId,
}

/// A verifier value (signing key) registered to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierRef {
    /// Verifier type.
    #[serde(rename = "type")]
    pub verifier_type: VerifierType,
    /// Verifier value, e.g. the on-chain signing key.
    pub value: String,
}

/// A persisted verifier row binding a key to an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verifier {
    /// The verifier itself.
    #[serde(flatten)]
    pub verifier: VerifierRef,
    /// The identity this verifier is registered to.
    pub identity: Uuid,
    /// Namespace.
    pub namespace: String,
    /// Registration time.
    pub created: Timestamp,
}

/// One member of a private group: an identity plus the node it receives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Member identity DID.
    pub identity: String,
    /// Node identity id that receives batches for this member.
    pub node: Uuid,
}

/// A private messaging group, content-addressed by the hash of its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Hash over namespace, name and members.
    pub hash: Bytes32,
    /// Namespace.
    pub namespace: String,
    /// Optional name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ordered member list.
    pub members: Vec<GroupMember>,
    /// Creation time.
    pub created: Timestamp,
}

impl Group {
    /// Compute the content hash of a group identity.
    #[must_use]
    pub fn compute_hash(namespace: &str, name: Option<&str>, members: &[GroupMember]) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        if let Some(name) = name {
            hasher.update(name.as_bytes());
        }
        for member in members {
            hasher.update(member.identity.as_bytes());
            hasher.update(member.node.as_bytes());
        }
        Bytes32::new(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_hash_covers_membership() {
        let a = GroupMember {
            identity: "did:weft:org/a".to_string(),
            node: Uuid::new_v4(),
        };
        let b = GroupMember {
            identity: "did:weft:org/b".to_string(),
            node: Uuid::new_v4(),
        };

        let h1 = Group::compute_hash("ns1", None, &[a.clone(), b.clone()]);
        let h2 = Group::compute_hash("ns1", None, &[a.clone(), b.clone()]);
        let h3 = Group::compute_hash("ns1", None, &[b, a]);

        assert_eq!(h1, h2);
        assert_ne!(h1, h3); // member order is part of the identity
    }
}

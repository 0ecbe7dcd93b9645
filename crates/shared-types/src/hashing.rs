//! Context and masked-pin hashing.
//!
//! Sequencing keys per topic:
//!
//! - broadcast context: `SHA-256(topic)`
//! - private context:   `SHA-256(group || topic)`
//! - masked pin:        `SHA-256(group || topic || identity || nonce)` with
//!   the nonce encoded as 8 big-endian bytes
//!
//! The masked pin hides both the topic and the sender from non-members, while
//! still letting every member derive the exact expected sequence
//! `H(..||0), H(..||1), ...` per `(group, topic, identity)`.

use sha2::{Digest, Sha256};

use crate::bytes32::Bytes32;

/// Context for a broadcast topic: `SHA-256(topic)`.
#[must_use]
pub fn unmasked_context(topic: &str) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    Bytes32::new(hasher.finalize().into())
}

/// Context for a private `(group, topic)` pair: `SHA-256(group || topic)`.
#[must_use]
pub fn masked_context(group: &Bytes32, topic: &str) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(group.as_bytes());
    hasher.update(topic.as_bytes());
    Bytes32::new(hasher.finalize().into())
}

/// Masked pin for one `(group, topic, identity, nonce)` tuple.
#[must_use]
pub fn masked_pin(group: &Bytes32, topic: &str, identity: &str, nonce: i64) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(group.as_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(identity.as_bytes());
    hasher.update((nonce as u64).to_be_bytes());
    Bytes32::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_are_stable_and_distinct() {
        let group = Bytes32::new([5; 32]);

        assert_eq!(unmasked_context("t1"), unmasked_context("t1"));
        assert_ne!(unmasked_context("t1"), unmasked_context("t2"));
        assert_ne!(unmasked_context("t1"), masked_context(&group, "t1"));
        assert_ne!(
            masked_context(&group, "t1"),
            masked_context(&Bytes32::new([6; 32]), "t1")
        );
    }

    #[test]
    fn test_masked_pin_sequence_has_no_collisions() {
        let group = Bytes32::new([5; 32]);
        let a = masked_pin(&group, "t1", "did:weft:org/a", 0);
        let b = masked_pin(&group, "t1", "did:weft:org/a", 1);
        let c = masked_pin(&group, "t1", "did:weft:org/b", 0);
        let d = masked_pin(&group, "t2", "did:weft:org/a", 0);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a, masked_pin(&group, "t1", "did:weft:org/a", 0));
    }
}

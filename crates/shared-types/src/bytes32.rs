//! 32-byte hash values, serialized as lowercase hex strings.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::ParseError;

/// A 32-byte value (SHA-256 output, group hash, masked pin, context).
///
/// Renders as 64 lowercase hex characters in JSON and logs. The zero value is
/// meaningful only as "unset" and never appears on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    /// Wrap a raw 32-byte array.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Bytes32(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let raw = hex::decode(s).map_err(|_| ParseError::InvalidHash(s.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| ParseError::InvalidHash(s.to_string()))?;
        Ok(Bytes32(bytes))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({})", hex::encode(self.0))
    }
}

impl FromStr for Bytes32 {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Bytes32(bytes)
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Bytes32::from_hex(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let value = Bytes32::new([0xab; 32]);
        let encoded = value.to_string();
        assert_eq!(encoded.len(), 64);
        assert_eq!(Bytes32::from_hex(&encoded).unwrap(), value);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let value = Bytes32::new([0x01; 32]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));

        let back: Bytes32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(Bytes32::from_hex("abcd").is_err());
        assert!(Bytes32::from_hex("zz".repeat(32).as_str()).is_err());
    }
}

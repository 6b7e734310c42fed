//! Correlation identifiers.
//!
//! A correlation id is 128 bits. Control frames carry it as 32 lowercase hex
//! characters; chunk frames carry the 16 raw bytes.

use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of a correlation id in bytes.
pub const ID_SIZE: usize = 16;

/// Identifies one request or tunnel across all of its frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId([u8; ID_SIZE]);

impl CorrelationId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Reads an id from exactly 16 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; ID_SIZE] = slice
            .try_into()
            .map_err(|_| ProtocolError::InvalidCorrelationId(hex::encode(slice)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Returns the 32-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.to_hex())
    }
}

impl FromStr for CorrelationId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_SIZE * 2 {
            return Err(ProtocolError::InvalidCorrelationId(s.to_string()));
        }
        let bytes =
            hex::decode(s).map_err(|_| ProtocolError::InvalidCorrelationId(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for CorrelationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_form_is_lowercase_32_chars() {
        let id = CorrelationId::from_bytes([0xAB; ID_SIZE]);
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text, "ab".repeat(16));
    }

    #[test]
    fn test_parse_text_form() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);

        // Uppercase input is accepted, output is always lowercase.
        let upper = id.to_hex().to_uppercase();
        let parsed: CorrelationId = upper.parse().unwrap();
        assert_eq!(parsed.to_hex(), id.to_hex());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "abc".parse::<CorrelationId>(),
            Err(ProtocolError::InvalidCorrelationId(_))
        ));
        assert!(matches!(
            "zz".repeat(16).parse::<CorrelationId>(),
            Err(ProtocolError::InvalidCorrelationId(_))
        ));
    }

    #[test]
    fn test_from_slice_requires_16_bytes() {
        assert!(CorrelationId::from_slice(&[0u8; 15]).is_err());
        assert!(CorrelationId::from_slice(&[0u8; 17]).is_err());
        let id = CorrelationId::from_slice(&[7u8; 16]).unwrap();
        assert_eq!(id.as_bytes(), &[7u8; 16]);
    }

    #[test]
    fn test_json_is_hex_string() {
        let id = CorrelationId::from_bytes([1; ID_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(16)));

        let parsed: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }
}

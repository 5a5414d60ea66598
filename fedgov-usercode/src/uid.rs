use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IdParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, found {found}")]
    Length { expected: usize, found: usize },
}

fn decode_fixed<const N: usize>(text: &str) -> Result<[u8; N], IdParseError> {
    let bytes = hex::decode(text)?;
    let found = bytes.len();
    bytes.try_into().map_err(|_| IdParseError::Length {
        expected: N,
        found,
    })
}

/// Identifier of stored objects: code units, results, policies, actions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid([u8; 16]);

impl Uid {
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

impl FromStr for Uid {
    type Err = IdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        decode_fixed(text).map(Self)
    }
}

impl TryFrom<String> for Uid {
    type Error = IdParseError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.to_string()
    }
}

/// Public verification key of a user or node. Renders as lowercase hex,
/// which is also the credential string used in derived function names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerifyKey([u8; 32]);

impl VerifyKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Deterministic key for a label, for local nodes and fixtures.
    pub fn derive(label: &str) -> Self {
        Self(*blake3::hash(label.as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = hex::encode(&self.0[..4]);
        write!(f, "VerifyKey({text}..)")
    }
}

impl FromStr for VerifyKey {
    type Err = IdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        decode_fixed(text).map(Self)
    }
}

impl TryFrom<String> for VerifyKey {
    type Error = IdParseError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<VerifyKey> for String {
    fn from(key: VerifyKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_round_trip_through_hex() {
        let uid = Uid::new();
        let text = uid.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<Uid>().unwrap(), uid);
        assert_eq!(
            serde_json::to_string(&uid).unwrap(),
            format!("\"{text}\"")
        );
    }

    #[test]
    fn derived_keys_are_stable() {
        assert_eq!(VerifyKey::derive("alice"), VerifyKey::derive("alice"));
        assert_ne!(VerifyKey::derive("alice"), VerifyKey::derive("bob"));
        assert!(matches!(
            "abcd".parse::<VerifyKey>(),
            Err(IdParseError::Length {
                expected: 32,
                found: 2
            })
        ));
    }
}

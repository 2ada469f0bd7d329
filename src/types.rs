//! small wire-level value types: ids, signatures, kinds, timestamps

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum HexError {
    #[error("expected {expected} hex characters, found {found}")]
    BadLength { expected: usize, found: usize },
    #[error("not valid hex: {0}")]
    BadDigit(#[from] hex::FromHexError),
}

/// decode a fixed-size lowercase-hex string
pub(crate) fn parse_fixed<const N: usize>(input: &str) -> Result<[u8; N], HexError> {
    if input.len() != N * 2 {
        return Err(HexError::BadLength {
            expected: N * 2,
            found: input.len(),
        });
    }

    let mut out = [0u8; N];
    hex::decode_to_slice(input, &mut out)?;
    Ok(out)
}

/// a 32-byte event id, hex on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ID([u8; 32]);

impl ID {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn parse(input: &str) -> Result<Self, HexError> {
        parse_fixed(input).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<String> for ID {
    type Error = HexError;

    fn try_from(value: String) -> Result<Self, HexError> {
        Self::parse(&value)
    }
}

impl From<ID> for String {
    fn from(id: ID) -> String {
        id.to_hex()
    }
}

impl fmt::Debug for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID({})", self.to_hex())
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// a 64-byte schnorr signature, hex on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature([u8; 64]);

impl Signature {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn parse(input: &str) -> Result<Self, HexError> {
        parse_fixed(input).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<String> for Signature {
    type Error = HexError;

    fn try_from(value: String) -> Result<Self, HexError> {
        Self::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> String {
        sig.to_hex()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// event kind number
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Kind(pub u16);

impl Kind {
    /// relay authentication events (NIP-42)
    pub const CLIENT_AUTH: Kind = Kind(22242);
    /// remote signing transport events (NIP-46)
    pub const REMOTE_SIGNING: Kind = Kind(24133);
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// unix timestamp in seconds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub fn now() -> Self {
        let unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self(unix as u32)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

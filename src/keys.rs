use crate::types::{parse_fixed, HexError};
use secp256k1::{global::SECP256K1, rand, Keypair, Parity, XOnlyPublicKey};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error(transparent)]
    Hex(#[from] HexError),
    #[error("not a valid secret key scalar")]
    BadSecretKey,
    #[error("no curve point has this x coordinate")]
    BadPublicKey,
}

/// a secp256k1 secret key, held as a ready-to-sign keypair
///
/// validation happens once at construction; signing and key derivation
/// never re-parse the scalar.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey(Keypair);

impl SecretKey {
    pub fn generate() -> Self {
        Self(Keypair::new(SECP256K1, &mut rand::rng()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        Keypair::from_seckey_byte_array(SECP256K1, bytes)
            .map(Self)
            .map_err(|_| KeyError::BadSecretKey)
    }

    pub fn parse(input: &str) -> Result<Self, KeyError> {
        Self::from_bytes(parse_fixed(input)?)
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.secret_bytes())
    }

    pub fn public_key(&self) -> PubKey {
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&self.0);
        PubKey(xonly)
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.0
    }

    /// the scalar form used for ECDH
    pub(crate) fn scalar(&self) -> secp256k1::SecretKey {
        self.0.secret_key()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the scalar
        write!(f, "SecretKey(for {})", self.public_key().to_hex())
    }
}

/// an x-only secp256k1 public key, hex on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PubKey(XOnlyPublicKey);

impl PubKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        XOnlyPublicKey::from_byte_array(bytes)
            .map(Self)
            .map_err(|_| KeyError::BadPublicKey)
    }

    pub fn parse(input: &str) -> Result<Self, KeyError> {
        Self::from_bytes(parse_fixed(input)?)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub(crate) fn xonly(&self) -> XOnlyPublicKey {
        self.0
    }

    /// lifted to a full curve point (even parity) for ECDH
    pub(crate) fn ecdh_point(&self) -> secp256k1::PublicKey {
        secp256k1::PublicKey::from_x_only_public_key(self.0, Parity::Even)
    }
}

impl TryFrom<String> for PubKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, KeyError> {
        Self::parse(&value)
    }
}

impl From<PubKey> for String {
    fn from(pk: PubKey) -> String {
        pk.to_hex()
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.to_hex())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

//! NIP-19: bech32-encoded keys
//!
//! encoding and decoding for the `npub` and `nsec` identity strings.

use crate::{PubKey, SecretKey};
use bech32::{Bech32, Hrp};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Nip19Error {
    #[error("bech32 decoding error")]
    Bech32(#[from] bech32::DecodeError),
    #[error("bech32 encoding error")]
    Bech32Encode(#[from] bech32::EncodeError),
    #[error("invalid data length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unknown prefix '{0}'")]
    UnknownPrefix(String),
    #[error("invalid key: {0}")]
    Key(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, Nip19Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult {
    SecretKey(SecretKey),
    PubKey(PubKey),
}

/// decode a bech32-encoded NIP-19 key string
pub fn decode(bech32_string: &str) -> Result<DecodeResult> {
    let (prefix, data) = bech32::decode(bech32_string)?;

    if data.len() != 32 {
        return Err(Nip19Error::InvalidLength {
            expected: 32,
            actual: data.len(),
        });
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&data);

    match prefix.as_str() {
        "nsec" => Ok(DecodeResult::SecretKey(SecretKey::from_bytes(bytes)?)),
        "npub" => Ok(DecodeResult::PubKey(PubKey::from_bytes(bytes)?)),
        other => Err(Nip19Error::UnknownPrefix(other.to_string())),
    }
}

/// decode an npub string into a public key
pub fn decode_npub(bech32_string: &str) -> Result<PubKey> {
    match decode(bech32_string)? {
        DecodeResult::PubKey(pk) => Ok(pk),
        DecodeResult::SecretKey(_) => Err(Nip19Error::UnknownPrefix("nsec".to_string())),
    }
}

/// encode a public key as an npub string
pub fn encode_npub(pubkey: &PubKey) -> Result<String> {
    let hrp = Hrp::parse("npub").expect("valid hrp");
    Ok(bech32::encode::<Bech32>(hrp, &pubkey.to_bytes())?)
}

/// encode a secret key as an nsec string
pub fn encode_nsec(secret_key: &SecretKey) -> Result<String> {
    let hrp = Hrp::parse("nsec").expect("valid hrp");
    Ok(bech32::encode::<Bech32>(hrp, &secret_key.secret_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_npub() {
        let pk = decode_npub("npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6")
            .unwrap();
        assert_eq!(
            pk.to_hex(),
            "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d"
        );
    }

    #[test]
    fn test_decode_nsec() {
        let result =
            decode("nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5").unwrap();
        match result {
            DecodeResult::SecretKey(sk) => assert_eq!(
                sk.to_hex(),
                "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa"
            ),
            _ => panic!("expected a secret key"),
        }
    }

    #[test]
    fn test_encode_round_trip() {
        let sk = SecretKey::generate();
        let pk = sk.public_key();

        let npub = encode_npub(&pk).unwrap();
        assert!(npub.starts_with("npub1"));
        assert_eq!(decode_npub(&npub).unwrap(), pk);

        let nsec = encode_nsec(&sk).unwrap();
        assert!(nsec.starts_with("nsec1"));
        match decode(&nsec).unwrap() {
            DecodeResult::SecretKey(back) => assert_eq!(back, sk),
            _ => panic!("expected a secret key"),
        }
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        // a "note" entity is not a key
        let hrp = Hrp::parse("note").unwrap();
        let encoded = bech32::encode::<Bech32>(hrp, &[0u8; 32]).unwrap();
        assert!(decode(&encoded).is_err());
    }
}

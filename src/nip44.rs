//! NIP-44 v2 payload encryption
//!
//! the standard scheme for encrypted direct messages, used here as the
//! transport encryption for remote-signing requests and responses.
//!
//! a payload is `base64(version || nonce || chacha20(padded plaintext) ||
//! hmac)`, with per-message keys derived from the conversation key by
//! HKDF-expand over the nonce.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use hmac::{Hmac, Mac};
use secp256k1::rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::{PubKey, SecretKey};

const VERSION: u8 = 2;
const MAX_PLAINTEXT_SIZE: usize = 65535;

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("plaintext must be between 1 and 65535 bytes")]
    PlaintextSize,
}

#[derive(Error, Debug, PartialEq)]
pub enum DecryptError {
    #[error("payload size out of range")]
    PayloadSize,

    #[error("unsupported payload version")]
    UnsupportedVersion,

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("message authentication failed")]
    BadMac,

    #[error("invalid padding")]
    BadPadding,
}

/// derive the shared conversation key for a (their pubkey, our secret key) pair
pub fn generate_conversation_key(pubkey: &PubKey, sk: &SecretKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(&pubkey.ecdh_point(), &sk.scalar());

    // HKDF-extract with the protocol label as salt, over the shared x coordinate
    hmac_sha256(b"nip44-v2", &[&point[..32]])
}

pub fn encrypt(
    plaintext: &str,
    conversation_key: &[u8; 32],
    custom_nonce: Option<[u8; 32]>,
) -> Result<String, EncryptError> {
    let nonce = custom_nonce.unwrap_or_else(random_nonce);
    let keys = MessageKeys::derive(conversation_key, &nonce);

    let mut buf = pad(plaintext.as_bytes())?;
    keys.cipher().apply_keystream(&mut buf);
    let mac = hmac_sha256(&keys.auth, &[&nonce, &buf]);

    let mut payload = Vec::with_capacity(1 + 32 + buf.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(&mac);

    Ok(BASE64.encode(payload))
}

pub fn decrypt(payload: &str, conversation_key: &[u8; 32]) -> Result<String, DecryptError> {
    if payload.len() < 132 || payload.len() > 87472 {
        return Err(DecryptError::PayloadSize);
    }
    // '#' marks a future non-base64 versioning scheme
    if payload.starts_with('#') {
        return Err(DecryptError::UnsupportedVersion);
    }

    let decoded = BASE64.decode(payload)?;
    let parts = split_payload(&decoded)?;

    let keys = MessageKeys::derive(conversation_key, &parts.nonce);
    if hmac_sha256(&keys.auth, &[&parts.nonce, parts.ciphertext]) != parts.mac {
        return Err(DecryptError::BadMac);
    }

    let mut buf = parts.ciphertext.to_vec();
    keys.cipher().apply_keystream(&mut buf);

    let plaintext = unpad(&buf)?;
    Ok(String::from_utf8_lossy(plaintext).into_owned())
}

/// the per-message keys, expanded from the conversation key and nonce
struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    auth: [u8; 32],
}

impl MessageKeys {
    /// HKDF-expand with the nonce as info: 76 bytes over three HMAC blocks,
    /// split into cipher key, cipher nonce and authentication key
    fn derive(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Self {
        let t1 = hmac_sha256(conversation_key, &[nonce, &[1]]);
        let t2 = hmac_sha256(conversation_key, &[&t1, nonce, &[2]]);
        let t3 = hmac_sha256(conversation_key, &[&t2, nonce, &[3]]);

        let mut chacha_nonce = [0u8; 12];
        chacha_nonce.copy_from_slice(&t2[..12]);

        let mut auth = [0u8; 32];
        auth[..20].copy_from_slice(&t2[12..]);
        auth[20..].copy_from_slice(&t3[..12]);

        Self {
            chacha_key: t1,
            chacha_nonce,
            auth,
        }
    }

    fn cipher(&self) -> ChaCha20 {
        ChaCha20::new(&self.chacha_key.into(), &self.chacha_nonce.into())
    }
}

struct Payload<'a> {
    nonce: [u8; 32],
    ciphertext: &'a [u8],
    mac: [u8; 32],
}

fn split_payload(decoded: &[u8]) -> Result<Payload<'_>, DecryptError> {
    if decoded.first() != Some(&VERSION) {
        return Err(DecryptError::UnsupportedVersion);
    }
    if decoded.len() < 99 || decoded.len() > 65603 {
        return Err(DecryptError::PayloadSize);
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&decoded[1..33]);
    let mut mac = [0u8; 32];
    mac.copy_from_slice(&decoded[decoded.len() - 32..]);

    Ok(Payload {
        nonce,
        ciphertext: &decoded[33..decoded.len() - 32],
        mac,
    })
}

/// prefix the plaintext with its big-endian length and zero-fill to the
/// padded size
fn pad(plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
    let len = plaintext.len();
    if len == 0 || len > MAX_PLAINTEXT_SIZE {
        return Err(EncryptError::PlaintextSize);
    }

    let mut padded = vec![0u8; 2 + padded_len(len)];
    padded[..2].copy_from_slice(&(len as u16).to_be_bytes());
    padded[2..2 + len].copy_from_slice(plaintext);
    Ok(padded)
}

fn unpad(buf: &[u8]) -> Result<&[u8], DecryptError> {
    if buf.len() < 2 {
        return Err(DecryptError::BadPadding);
    }

    let unpadded_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if unpadded_len == 0
        || unpadded_len > MAX_PLAINTEXT_SIZE
        || buf.len() != 2 + padded_len(unpadded_len)
    {
        return Err(DecryptError::BadPadding);
    }

    Ok(&buf[2..2 + unpadded_len])
}

/// padded sizes are multiples of a chunk that grows with the message:
/// 32 bytes up to 256, then an eighth of the next power of two
fn padded_len(unpadded: usize) -> usize {
    if unpadded <= 32 {
        return 32;
    }
    let chunk = ((unpadded - 1).next_power_of_two() / 8).max(32);
    chunk * unpadded.div_ceil(chunk)
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    secp256k1::rand::rng().fill_bytes(&mut nonce);
    nonce
}

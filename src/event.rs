use crate::{Kind, PubKey, SecretKey, Signature, Tags, Timestamp, ID};
use secp256k1::{schnorr, SECP256K1};
use sha2::{Digest, Sha256};

/// the NIP-01 id preimage: `[0, pubkey, created_at, kind, tags, content]`
pub(crate) fn canonical_bytes(
    pubkey: &PubKey,
    created_at: Timestamp,
    kind: Kind,
    tags: &Tags,
    content: &str,
) -> Vec<u8> {
    serde_json::to_vec(&(0u8, pubkey, created_at, kind, tags, content))
        .expect("canonical event serialization cannot fail")
}

/// a signed nostr event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub id: ID,
    pub pubkey: PubKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    /// the id this event should carry, derived from its contents
    pub fn compute_id(&self) -> ID {
        let digest = Sha256::digest(canonical_bytes(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ));
        ID::new(digest.into())
    }

    pub fn check_id(&self) -> bool {
        self.compute_id() == self.id
    }

    pub fn verify_signature(&self) -> bool {
        let digest = Sha256::digest(canonical_bytes(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ));
        let signature = schnorr::Signature::from_byte_array(*self.sig.as_bytes());

        SECP256K1
            .verify_schnorr(&signature, &digest, &self.pubkey.xonly())
            .is_ok()
    }
}

// identity is the id
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// an unsigned event, ready to be finalized with a key
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EventTemplate {
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    pub content: String,
}

impl EventTemplate {
    /// sign the template, producing the full event with id, pubkey and sig
    pub fn finalize(self, key: &SecretKey) -> Event {
        let pubkey = key.public_key();
        let digest = Sha256::digest(canonical_bytes(
            &pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ));
        let signature = SECP256K1.sign_schnorr_no_aux_rand(&digest, key.keypair());

        Event {
            id: ID::new(digest.into()),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: Signature::new(signature.to_byte_array()),
        }
    }
}

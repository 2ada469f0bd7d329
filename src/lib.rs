//! # tether
//!
//! client-side relay connectivity for nostr
//!
//! this library implements the hard parts of a nostr client: a per-relay
//! connection state machine (WebSocket lifecycle, reconnection backoff,
//! flapping detection, frame dispatch, in-flight request correlation and
//! AUTH challenges) and remote signing sessions that delegate signing and
//! encryption to a NIP-46 counterpart over encrypted kind-24133 events.

pub mod envelopes;
pub mod event;
pub mod filter;
pub mod keys;
pub mod nip05;
pub mod nip19;
pub mod nip44;

// re-export commonly used types
mod connection;
mod normalize;
mod signer;
mod stats;
mod subscription;
mod tags;
mod types;

#[cfg(test)]
mod testrelay;

pub use connection::{
    set_default_auth_policy, AuthDecision, AuthPolicy, Connection, ConnectionError,
    ConnectionEvent, ConnectionOptions, Status,
};
pub use event::{Event, EventTemplate};
pub use filter::Filter;
pub use keys::{KeyError, PubKey, SecretKey};
pub use normalize::normalize_url;
pub use signer::{AuthUrlHandler, RemoteSigner, SignerError, SignerOptions};
pub use stats::ConnectionStats;
pub use subscription::{Subscription, SubscriptionParams, SubscriptionUpdate};
pub use tags::Tags;
pub use types::{HexError, Kind, Signature, Timestamp, ID};

/// result type used by the loose edges of the library
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

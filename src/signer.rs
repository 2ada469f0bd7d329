//! remote signing sessions (NIP-46)
//!
//! a client-side session that delegates signing, encryption and decryption
//! to a remote signer over encrypted kind-24133 events: one long-lived
//! subscription carries responses, every request is a fresh publish.

use crate::connection::{Connection, ConnectionError};
use crate::subscription::{SubscriptionParams, SubscriptionUpdate};
use crate::{nip05, nip19, nip44};
use crate::{Event, EventTemplate, Filter, Kind, PubKey, SecretKey, Signature, Tags, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

/// grace period between firing the response subscription and the first
/// request, so responses cannot race ahead of our readiness to receive
const SUBSCRIPTION_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: String,
    method: &'a str,
    params: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

pub struct AuthUrlHandler(Box<dyn Fn(String) + Send + Sync>);

impl AuthUrlHandler {
    pub fn new(handler: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self(Box::new(handler))
    }
}

impl Debug for AuthUrlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn")
    }
}

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid signer token: {0}")]
    Token(String),

    #[error("remote identifier did not resolve: {0}")]
    RemoteUnknown(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("remote signer replied with an error: {0}")]
    Remote(String),

    #[error("connection closed before the response arrived")]
    ConnectionClosed,

    #[error("session is not ready yet")]
    NotReady,

    #[error("request encryption failed: {0}")]
    Encrypt(#[from] nip44::EncryptError),

    #[error("relay error: {0}")]
    Relay(#[from] ConnectionError),

    #[error("unexpected payload from the remote: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("remote returned an invalid event")]
    InvalidRemoteEvent,
}

#[derive(Debug, Clone)]
enum RemoteTarget {
    Known(PubKey),
    /// a human-readable identifier, resolved during the handshake
    Deferred(String),
}

#[derive(Default)]
pub struct SignerOptions {
    /// key used to encrypt to the counterpart; generated fresh if absent
    pub local_key: Option<SecretKey>,
    /// invoked when the remote asks the user to approve a request in a browser
    pub on_auth_url: Option<AuthUrlHandler>,
}

struct SignerState {
    remote: RwLock<RemoteTarget>,
    conversation_key: RwLock<Option<[u8; 32]>>,
    serial: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Response>>,
    on_auth_url: Option<AuthUrlHandler>,
}

/// a remote signing session over one relay connection
///
/// cheap to clone; clones share the correlation state. constructed from a
/// token and usable after [`RemoteSigner::wait_until_ready`] succeeds.
#[derive(Clone)]
pub struct RemoteSigner {
    connection: Connection,
    local_key: SecretKey,
    token: Option<String>,
    state: Arc<SignerState>,
}

impl RemoteSigner {
    /// build a session from a token string
    ///
    /// accepted forms: `npub…#otp`, `npub…`, a NIP-05 identifier (anything
    /// with a dot, resolved lazily), or a raw 64-char hex pubkey.
    pub fn new(
        token: &str,
        connection: Connection,
        opts: SignerOptions,
    ) -> Result<Self, SignerError> {
        let (target, otp) = parse_token(token)?;
        let local_key = opts.local_key.unwrap_or_else(SecretKey::generate);

        let conversation_key = match &target {
            RemoteTarget::Known(pk) => Some(nip44::generate_conversation_key(pk, &local_key)),
            RemoteTarget::Deferred(_) => None,
        };

        Ok(Self {
            connection,
            local_key,
            token: otp,
            state: Arc::new(SignerState {
                remote: RwLock::new(target),
                conversation_key: RwLock::new(conversation_key),
                serial: AtomicU64::new(0),
                pending: DashMap::new(),
                on_auth_url: opts.on_auth_url,
            }),
        })
    }

    pub fn local_pubkey(&self) -> PubKey {
        self.local_key.public_key()
    }

    pub async fn remote_pubkey(&self) -> Option<PubKey> {
        match *self.state.remote.read().await {
            RemoteTarget::Known(pk) => Some(pk),
            RemoteTarget::Deferred(_) => None,
        }
    }

    /// perform the handshake; resolves with the remote pubkey once the
    /// remote acknowledged the session
    pub async fn wait_until_ready(&self) -> Result<PubKey, SignerError> {
        let local_pub = self.local_key.public_key();

        // a deferred identifier has to be resolved before anything is sent
        let remote = {
            let target = self.state.remote.read().await.clone();
            match target {
                RemoteTarget::Known(pk) => pk,
                RemoteTarget::Deferred(name) => {
                    let resolved = nip05::query_identifier(&name)
                        .await
                        .map_err(|err| SignerError::RemoteUnknown(format!("{name}: {err}")))?;
                    *self.state.remote.write().await = RemoteTarget::Known(resolved.pubkey);
                    *self.state.conversation_key.write().await = Some(
                        nip44::generate_conversation_key(&resolved.pubkey, &self.local_key),
                    );
                    resolved.pubkey
                }
            }
        };

        // the response listener is dispatched before the first request
        let mut subscription = self
            .connection
            .subscribe(
                vec![Filter {
                    kinds: Some(vec![Kind::REMOTE_SIGNING]),
                    tags: Some(vec![("p".to_string(), vec![local_pub.to_hex()])]),
                    ..Default::default()
                }],
                SubscriptionParams::default(),
            )
            .await?;

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(update) = subscription.recv().await {
                match update {
                    SubscriptionUpdate::Event(event) => session.handle_transport_event(event).await,
                    SubscriptionUpdate::EndOfStored => {}
                    SubscriptionUpdate::Closed(reason) => {
                        debug!(%reason, "signer transport subscription closed");
                        break;
                    }
                }
            }
            // dropping the senders rejects every waiting request
            session.state.pending.clear();
        });

        tokio::time::sleep(SUBSCRIPTION_SETTLE).await;

        let mut params = vec![local_pub.to_hex()];
        if let Some(token) = &self.token {
            params.push(token.clone());
        }

        let result = self.rpc("connect", params).await?;
        if result == "ack" {
            Ok(remote)
        } else {
            Err(SignerError::Handshake(format!(
                "unexpected connect result '{result}'"
            )))
        }
    }

    pub async fn ping(&self) -> Result<(), SignerError> {
        self.rpc("ping", vec![]).await?;
        Ok(())
    }

    /// have the remote sign an event template; returns the signature
    pub async fn sign(&self, template: EventTemplate) -> Result<Signature, SignerError> {
        let template_json = serde_json::to_string(&template)?;
        let result = self.rpc("sign_event", vec![template_json]).await?;

        let event: Event =
            serde_json::from_str(&result).map_err(|_| SignerError::InvalidRemoteEvent)?;
        if !event.verify_signature() {
            return Err(SignerError::InvalidRemoteEvent);
        }

        Ok(event.sig)
    }

    pub async fn encrypt(
        &self,
        recipient: &PubKey,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        self.rpc(
            "nip04_encrypt",
            vec![recipient.to_hex(), plaintext.to_string()],
        )
        .await
    }

    pub async fn decrypt(&self, sender: &PubKey, ciphertext: &str) -> Result<String, SignerError> {
        let result = self
            .rpc(
                "nip04_decrypt",
                vec![sender.to_hex(), ciphertext.to_string()],
            )
            .await?;

        // the remote wraps the plaintext in a JSON array; kept as-is for
        // wire compatibility
        let mut parts: Vec<String> = serde_json::from_str(&result)?;
        if parts.is_empty() {
            return Err(SignerError::Remote("empty decrypt result".to_string()));
        }
        Ok(parts.remove(0))
    }

    async fn handle_transport_event(&self, event: Event) {
        if event.kind != Kind::REMOTE_SIGNING {
            return;
        }

        let Some(key) = *self.state.conversation_key.read().await else {
            return;
        };
        let Ok(plain) = nip44::decrypt(&event.content, &key) else {
            debug!(event = %event.id, "undecryptable transport event");
            return;
        };
        let Ok(response) = serde_json::from_str::<Response>(&plain) else {
            debug!(event = %event.id, "malformed transport response");
            return;
        };

        // the remote wants the user to approve in a browser; the request
        // itself stays pending until the real response arrives
        if response.result.as_deref() == Some("auth_url") {
            if let Some(url) = &response.error {
                if let Some(handler) = &self.state.on_auth_url {
                    handler.0(url.clone());
                }
            }
            return;
        }

        if let Some((_, tx)) = self.state.pending.remove(&response.id) {
            let _ = tx.send(response);
        }
    }

    async fn rpc(&self, method: &str, params: Vec<String>) -> Result<String, SignerError> {
        let remote = match *self.state.remote.read().await {
            RemoteTarget::Known(pk) => pk,
            RemoteTarget::Deferred(_) => return Err(SignerError::NotReady),
        };
        let Some(key) = *self.state.conversation_key.read().await else {
            return Err(SignerError::NotReady);
        };

        let id = self.state.serial.fetch_add(1, Ordering::SeqCst).to_string();
        let request = Request {
            id: id.clone(),
            method,
            params,
        };
        let request_json =
            serde_json::to_string(&request).expect("request should not fail to encode as json");
        let content = nip44::encrypt(&request_json, &key, None)?;

        let event = EventTemplate {
            content,
            created_at: Timestamp::now(),
            kind: Kind::REMOTE_SIGNING,
            tags: Tags::pairs([("p", remote.to_hex())]),
        }
        .finalize(&self.local_key);

        let (tx, rx) = oneshot::channel();
        self.state.pending.insert(id.clone(), tx);

        if let Err(err) = self.connection.publish(event).await {
            self.state.pending.remove(&id);
            return Err(err.into());
        }

        // no intrinsic timeout: the host wraps requests with its own deadline
        match rx.await {
            Ok(response) => match response.error {
                Some(err) => Err(SignerError::Remote(err)),
                None => Ok(response.result.unwrap_or_default()),
            },
            Err(_) => Err(SignerError::ConnectionClosed),
        }
    }
}

impl Debug for RemoteSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSigner")
            .field("connection", &self.connection.url().as_str())
            .field("pending", &self.state.pending.len())
            .finish()
    }
}

fn parse_token(token: &str) -> Result<(RemoteTarget, Option<String>), SignerError> {
    if let Some((npub, otp)) = token.split_once('#') {
        let pk = nip19::decode_npub(npub).map_err(|err| SignerError::Token(err.to_string()))?;
        Ok((RemoteTarget::Known(pk), Some(otp.to_string())))
    } else if token.starts_with("npub") {
        let pk = nip19::decode_npub(token).map_err(|err| SignerError::Token(err.to_string()))?;
        Ok((RemoteTarget::Known(pk), None))
    } else if token.contains('.') {
        Ok((RemoteTarget::Deferred(token.to_string()), None))
    } else {
        let pk =
            PubKey::parse(token).map_err(|err| SignerError::Token(err.to_string()))?;
        Ok((RemoteTarget::Known(pk), None))
    }
}

use crate::envelopes::Envelope;
use crate::normalize::normalize_url;
use crate::stats::ConnectionStats;
use crate::subscription::{Subscription, SubscriptionParams, SubscriptionUpdate};
use crate::{Event, EventTemplate, Filter, Kind, SecretKey, Tags, Timestamp, ID};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EOSE_TIMEOUT: Duration = Duration::from_millis(4400);
const PING_INTERVAL: Duration = Duration::from_secs(29);
const RECONNECT_STEP: Duration = Duration::from_millis(5000);
const RECONNECT_WINDOW: Duration = Duration::from_millis(60_000);
const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(2000);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection is not open")]
    NotConnected,

    #[error("a connect attempt is already in progress")]
    AlreadyConnecting,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("connection closed while a reply was pending")]
    ConnectionClosed,

    #[error("relay rejected event: {0}")]
    Rejected(String),

    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
    Authenticating,
    Authenticated,
    Disconnecting,
    Flapping,
}

impl Status {
    /// states in which the socket is established and frames may be sent
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Status::Connected | Status::Authenticating | Status::Authenticated
        )
    }
}

/// observable connection side effects, delivered over a broadcast channel
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Ready,
    Disconnected,
    Notice(String),
    /// an AUTH challenge arrived and no auth policy is configured
    AuthRequired(String),
    Authed,
    Flapping(ConnectionStats),
    DelayedConnect(Duration),
}

/// what an auth policy wants done with a challenge
pub enum AuthDecision {
    /// build the default kind-22242 event and sign it with the configured signer
    SignChallenge,
    /// respond with a ready-made signed event
    Provide(Event),
    /// leave the challenge unanswered
    Decline,
}

pub type AuthPolicy = Arc<dyn Fn(&Url, &str) -> AuthDecision + Send + Sync>;

static DEFAULT_AUTH_POLICY: StdRwLock<Option<AuthPolicy>> = StdRwLock::new(None);

/// install a process-wide auth policy used by connections without their own
pub fn set_default_auth_policy(policy: AuthPolicy) {
    *DEFAULT_AUTH_POLICY.write().unwrap() = Some(policy);
}

fn default_auth_policy() -> Option<AuthPolicy> {
    DEFAULT_AUTH_POLICY.read().unwrap().clone()
}

#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// how long a connect attempt may take before it is abandoned
    pub connect_timeout: Option<Duration>,
    /// per-relay auth policy, consulted before the process-wide default
    pub auth_policy: Option<AuthPolicy>,
    /// key used to sign default auth events
    pub signer: Option<SecretKey>,
    /// how long to wait for EOSE before synthesizing one
    pub base_eose_timeout: Option<Duration>,
}

pub(crate) struct SubscriptionEntry {
    sender: mpsc::Sender<SubscriptionUpdate>,
    filters: Vec<Filter>,
    eosed: bool,
}

struct Inner {
    url: Url,
    opts: ConnectionOptions,
    status: RwLock<Status>,
    writer: Mutex<Option<WsWriter>>,
    /// bumped at every connect attempt; lets stale session tasks detect
    /// they have been superseded
    epoch: AtomicU64,
    /// mints subscription and count correlation ids
    serial: AtomicU64,
    subscriptions: DashMap<String, SubscriptionEntry>,
    count_waiters: DashMap<String, oneshot::Sender<Result<u64, ConnectionError>>>,
    publish_waiters: DashMap<ID, oneshot::Sender<Result<String, ConnectionError>>>,
    stats: StdMutex<ConnectionStats>,
    last_connected_at: StdMutex<Option<Instant>>,
    events: broadcast::Sender<ConnectionEvent>,
    reconnect_timer: StdMutex<Option<JoinHandle<()>>>,
    /// bumped by explicit connect/disconnect so a pending reconnect burst
    /// knows to stand down
    reconnect_round: AtomicU64,
}

/// a client connection to a single relay
///
/// cheap to clone; all clones share the same underlying state. exactly one
/// socket session is live at a time, owned by its reader task.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(url: &str, opts: ConnectionOptions) -> Result<Self, ConnectionError> {
        let url = normalize_url(url)?;
        let (events, _) = broadcast::channel(128);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                opts,
                status: RwLock::new(Status::Disconnected),
                writer: Mutex::new(None),
                epoch: AtomicU64::new(0),
                serial: AtomicU64::new(0),
                subscriptions: DashMap::new(),
                count_waiters: DashMap::new(),
                publish_waiters: DashMap::new(),
                stats: StdMutex::new(ConnectionStats::default()),
                last_connected_at: StdMutex::new(None),
                events,
                reconnect_timer: StdMutex::new(None),
                reconnect_round: AtomicU64::new(0),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub async fn status(&self) -> Status {
        *self.inner.status.read().await
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().unwrap().clone()
    }

    /// subscribe to the connection's observable events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn set_status(&self, status: Status) {
        let mut current = self.inner.status.write().await;
        debug!(url = %self.inner.url, from = ?*current, to = ?status, "status change");
        *current = status;
    }

    fn next_serial(&self) -> u64 {
        self.inner.serial.fetch_add(1, Ordering::SeqCst)
    }

    /// open the socket; on failure the reconnect path takes over
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.reconnect_round.fetch_add(1, Ordering::SeqCst);

        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(ConnectionError::AlreadyConnecting) => Err(ConnectionError::AlreadyConnecting),
            Err(err) => {
                self.schedule_reconnect().await;
                Err(err)
            }
        }
    }

    async fn try_connect(&self) -> Result<(), ConnectionError> {
        {
            let mut status = self.inner.status.write().await;
            match *status {
                Status::Disconnected | Status::Flapping => *status = Status::Connecting,
                Status::Connected | Status::Authenticating | Status::Authenticated => {
                    *status = Status::Reconnecting
                }
                // the reconnect scheduler sets this before calling in
                Status::Reconnecting => {}
                Status::Connecting | Status::Disconnecting => {
                    return Err(ConnectionError::AlreadyConnecting)
                }
            }
        }

        // supersede whatever session might still be around
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut old) = self.inner.writer.lock().await.take() {
            let _ = old.close().await;
        }

        self.inner.stats.lock().unwrap().record_attempt();

        let connect_timeout = self
            .inner
            .opts
            .connect_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let request = match self.inner.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                self.fail_connect().await;
                return Err(err.into());
            }
        };

        let stream = match tokio::time::timeout(
            connect_timeout,
            connect_async_tls_with_config(request, None, false, None),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                self.fail_connect().await;
                return Err(err.into());
            }
            Err(_elapsed) => {
                self.fail_connect().await;
                return Err(ConnectionError::ConnectTimeout);
            }
        };

        let (write, read) = stream.split();
        *self.inner.writer.lock().await = Some(write);
        self.inner.stats.lock().unwrap().record_success();
        *self.inner.last_connected_at.lock().unwrap() = Some(Instant::now());

        self.set_status(Status::Connected).await;
        self.emit(ConnectionEvent::Connected);
        self.emit(ConnectionEvent::Ready);

        self.spawn_session_tasks(read, epoch);
        Ok(())
    }

    async fn fail_connect(&self) {
        self.set_status(Status::Disconnected).await;
        self.emit(ConnectionEvent::Disconnected);
    }

    /// close the socket and stay closed: no reconnection is attempted
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.inner.reconnect_round.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.inner.reconnect_timer.lock().unwrap().take() {
            handle.abort();
        }

        {
            let mut status = self.inner.status.write().await;
            if *status == Status::Disconnected {
                return Ok(());
            }
            *status = Status::Disconnecting;
        }

        let had_socket = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(w) => {
                    let _ = w.close().await;
                    true
                }
                None => false,
            }
        };

        if !had_socket {
            // nothing live to wait for: settle immediately
            self.set_status(Status::Disconnected).await;
            self.emit(ConnectionEvent::Disconnected);
        }

        Ok(())
    }

    /// serialize and transmit a frame; fails unless the connection is open
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if !self.status().await.is_open() {
            return Err(ConnectionError::NotConnected);
        }

        let json = serde_json::to_string(envelope)?;
        debug!(url = %self.inner.url, frame = %json, "sending");

        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.send(Message::text(json)).await?;
                Ok(())
            }
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// register a subscription without sending anything yet
    pub fn prepare_subscription(
        &self,
        filters: Vec<Filter>,
        params: SubscriptionParams,
    ) -> Subscription {
        let id = params
            .id
            .unwrap_or_else(|| format!("sub:{}", self.next_serial()));

        let (sender, updates) = mpsc::channel(16);
        self.inner.subscriptions.insert(
            id.clone(),
            SubscriptionEntry {
                sender,
                filters: filters.clone(),
                eosed: false,
            },
        );

        Subscription::new(self.clone(), id, filters, updates)
    }

    /// open a subscription and put it on the wire in one step
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        params: SubscriptionParams,
    ) -> Result<Subscription, ConnectionError> {
        let mut subscription = self.prepare_subscription(filters, params);
        subscription.fire().await?;
        Ok(subscription)
    }

    /// publish an event; resolves with the relay's OK reason
    pub async fn publish(&self, event: Event) -> Result<String, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.inner.publish_waiters.insert(event.id, tx);

        if let Err(err) = self.send(&Envelope::EventOut { event: event.clone() }).await {
            self.inner.publish_waiters.remove(&event.id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectionClosed),
        }
    }

    /// ask the relay how many stored events match the filters
    pub async fn count(&self, filters: Vec<Filter>) -> Result<u64, ConnectionError> {
        let id = format!("count:{}", self.next_serial());
        let (tx, rx) = oneshot::channel();
        self.inner.count_waiters.insert(id.clone(), tx);

        if let Err(err) = self
            .send(&Envelope::CountAsk {
                subscription_id: id.clone(),
                filters,
            })
            .await
        {
            self.inner.count_waiters.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectionClosed),
        }
    }

    pub(crate) fn forget_subscription(&self, id: &str) {
        self.inner.subscriptions.remove(id);
    }

    pub(crate) fn arm_eose_timer(&self, id: String) {
        let conn = self.clone();
        let timeout = self
            .inner
            .opts
            .base_eose_timeout
            .unwrap_or(DEFAULT_EOSE_TIMEOUT);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            conn.deliver_eose(&id).await;
        });
    }

    fn spawn_session_tasks(&self, mut read: WsReader, epoch: u64) {
        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => conn.dispatch_frame(text.as_str()).await,
                    Ok(Message::Ping(payload)) => {
                        let mut writer = conn.inner.writer.lock().await;
                        if let Some(w) = writer.as_mut() {
                            let _ = w.send(Message::Pong(payload)).await;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(url = %conn.inner.url, error = %err, "socket error");
                        break;
                    }
                }
            }
            conn.finish_session(epoch).await;
        });

        // keepalive pings for this session
        let conn = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if conn.inner.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                let mut writer = conn.inner.writer.lock().await;
                match writer.as_mut() {
                    Some(w) => {
                        if w.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
    }

    /// the socket ended: settle state, reject waiters, maybe reconnect
    async fn finish_session(&self, epoch: u64) {
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            // a newer session took over already
            return;
        }

        *self.inner.writer.lock().await = None;

        let was_explicit = { *self.inner.status.read().await == Status::Disconnecting };

        self.inner.stats.lock().unwrap().record_session_end();
        self.set_status(Status::Disconnected).await;
        self.emit(ConnectionEvent::Disconnected);

        // every pending resolver is rejected, every subscription told
        let sub_ids: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in sub_ids {
            if let Some((_, entry)) = self.inner.subscriptions.remove(&id) {
                let _ = entry
                    .sender
                    .send(SubscriptionUpdate::Closed("connection closed".to_string()))
                    .await;
            }
        }

        let count_ids: Vec<String> = self
            .inner
            .count_waiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in count_ids {
            if let Some((_, tx)) = self.inner.count_waiters.remove(&id) {
                let _ = tx.send(Err(ConnectionError::ConnectionClosed));
            }
        }

        let publish_ids: Vec<ID> = self
            .inner
            .publish_waiters
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for id in publish_ids {
            if let Some((_, tx)) = self.inner.publish_waiters.remove(&id) {
                let _ = tx.send(Err(ConnectionError::ConnectionClosed));
            }
        }

        if !was_explicit {
            self.schedule_reconnect().await;
        }
    }

    /// schedule a reconnection burst, unless one is pending or the relay is flapping
    async fn schedule_reconnect(&self) {
        {
            let timer = self.inner.reconnect_timer.lock().unwrap();
            if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return;
            }
        }

        let stats_snapshot = self.stats();
        if stats_snapshot.is_flapping() {
            self.set_status(Status::Flapping).await;
            self.emit(ConnectionEvent::Flapping(stats_snapshot));
            return;
        }

        let round = self.inner.reconnect_round.load(Ordering::SeqCst);
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let delay = conn.reconnect_delay(attempt);
                conn.inner.stats.lock().unwrap().next_reconnect_at = Some(Instant::now() + delay);
                conn.emit(ConnectionEvent::DelayedConnect(delay));
                tokio::time::sleep(delay).await;

                if conn.inner.reconnect_round.load(Ordering::SeqCst) != round {
                    // an explicit connect or disconnect happened meanwhile
                    break;
                }

                conn.set_status(Status::Reconnecting).await;
                match conn.try_connect().await {
                    Ok(()) => break,
                    Err(err) => {
                        attempt += 1;
                        if attempt >= MAX_RECONNECT_ATTEMPTS {
                            warn!(url = %conn.inner.url, error = %err, "giving up on reconnection");
                            break;
                        }
                    }
                }
            }
        });
        *self.inner.reconnect_timer.lock().unwrap() = Some(handle);
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        match *self.inner.last_connected_at.lock().unwrap() {
            // wait out the remainder of the stability window
            Some(at) => RECONNECT_WINDOW.saturating_sub(at.elapsed()),
            None => RECONNECT_STEP * (attempt + 1),
        }
    }

    async fn dispatch_frame(&self, raw: &str) {
        let envelope = match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(url = %self.inner.url, error = %err, "dropping malformed frame");
                return;
            }
        };

        match envelope {
            Envelope::EventIn {
                subscription_id,
                event,
            } => {
                let delivery = self
                    .inner
                    .subscriptions
                    .get(&subscription_id)
                    .map(|entry| (entry.sender.clone(), entry.filters.clone()));

                if let Some((sender, filters)) = delivery {
                    if filters.iter().all(|filter| filter.matches(&event)) {
                        let _ = sender.send(SubscriptionUpdate::Event(event)).await;
                    }
                }
            }
            Envelope::Eose { subscription_id } => {
                self.deliver_eose(&subscription_id).await;
            }
            Envelope::Closed {
                subscription_id,
                reason,
            } => {
                if let Some((_, entry)) = self.inner.subscriptions.remove(&subscription_id) {
                    let _ = entry.sender.send(SubscriptionUpdate::Closed(reason)).await;
                }
            }
            Envelope::Ok {
                event_id,
                ok,
                reason,
            } => match self.inner.publish_waiters.remove(&event_id) {
                Some((_, tx)) => {
                    let result = if ok {
                        Ok(reason)
                    } else {
                        Err(ConnectionError::Rejected(reason))
                    };
                    let _ = tx.send(result);
                }
                None => {
                    debug!(url = %self.inner.url, event = %event_id, ok, %reason, "received OK for unknown event");
                }
            },
            Envelope::CountReply {
                subscription_id,
                count,
            } => match self.inner.count_waiters.remove(&subscription_id) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(count));
                }
                None => {
                    debug!(url = %self.inner.url, id = %subscription_id, count, "received COUNT for unknown request");
                }
            },
            Envelope::Notice(text) => {
                self.emit(ConnectionEvent::Notice(text.clone()));

                // relays complaining about volume get a cool-down instead of
                // a dead connection ("Too many …", "Maximum …")
                if text.contains("oo many") || text.contains("aximum") {
                    debug!(url = %self.inner.url, notice = %text, "rate-limit notice, recycling connection");
                    self.recycle().await;
                }
            }
            Envelope::AuthChallenge { challenge } => {
                self.handle_auth_challenge(challenge).await;
            }
            other => {
                debug!(url = %self.inner.url, label = other.label(), "unexpected envelope");
            }
        }
    }

    async fn deliver_eose(&self, subscription_id: &str) {
        let sender = match self.inner.subscriptions.get_mut(subscription_id) {
            Some(mut entry) if !entry.eosed => {
                entry.eosed = true;
                entry.sender.clone()
            }
            _ => return,
        };
        let _ = sender.send(SubscriptionUpdate::EndOfStored).await;
    }

    /// drop the socket and come back after a short pause
    async fn recycle(&self) {
        let _ = self.disconnect().await;

        let conn = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
            let _ = conn.connect().await;
        });
    }

    async fn handle_auth_challenge(&self, challenge: String) {
        // a duplicate challenge while one is in flight is noise
        if *self.inner.status.read().await == Status::Authenticating {
            return;
        }

        let policy = self
            .inner
            .opts
            .auth_policy
            .clone()
            .or_else(default_auth_policy);
        let Some(policy) = policy else {
            self.emit(ConnectionEvent::AuthRequired(challenge));
            return;
        };

        self.set_status(Status::Authenticating).await;

        let event = match policy(&self.inner.url, &challenge) {
            AuthDecision::Decline => {
                self.set_status(Status::Connected).await;
                return;
            }
            AuthDecision::Provide(event) => event,
            AuthDecision::SignChallenge => {
                let Some(signer) = self.inner.opts.signer else {
                    warn!(url = %self.inner.url, "auth policy requested signing but no signer is configured");
                    self.set_status(Status::Connected).await;
                    return;
                };
                EventTemplate {
                    created_at: Timestamp::now(),
                    kind: Kind::CLIENT_AUTH,
                    tags: Tags::pairs([
                        ("relay", self.inner.url.to_string()),
                        ("challenge", challenge),
                    ]),
                    content: String::new(),
                }
                .finalize(&signer)
            }
        };

        let (tx, rx) = oneshot::channel();
        self.inner.publish_waiters.insert(event.id, tx);

        if let Err(err) = self.send(&Envelope::AuthEvent { event }).await {
            debug!(url = %self.inner.url, error = %err, "failed to send auth event");
            self.set_status(Status::Connected).await;
            return;
        }

        // resolve off the reader task so inbound frames keep flowing
        let conn = self.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_reason)) => {
                    conn.set_status(Status::Authenticated).await;
                    conn.emit(ConnectionEvent::Authed);
                }
                Ok(Err(err)) => {
                    debug!(url = %conn.inner.url, error = %err, "auth event not accepted");
                    if *conn.inner.status.read().await == Status::Authenticating {
                        conn.set_status(Status::Connected).await;
                    }
                }
                Err(_) => {}
            }
        });
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testrelay::TestRelay;

    fn kind1_event(content: &str) -> Event {
        EventTemplate {
            created_at: Timestamp(1750711742),
            kind: Kind(1),
            tags: Tags::default(),
            content: content.to_string(),
        }
        .finalize(&SecretKey::generate())
    }

    async fn connected_pair() -> (TestRelay, Connection) {
        let relay = TestRelay::start().await;
        let conn = Connection::new(&relay.url(), ConnectionOptions::default()).unwrap();
        conn.connect().await.unwrap();
        (relay, conn)
    }

    #[tokio::test]
    async fn test_connect_emits_connected_and_ready() {
        let relay = TestRelay::start().await;
        let conn = Connection::new(&relay.url(), ConnectionOptions::default()).unwrap();
        let mut events = conn.events();

        conn.connect().await.unwrap();
        assert_eq!(conn.status().await, Status::Connected);

        assert!(matches!(events.recv().await, Ok(ConnectionEvent::Connected)));
        assert!(matches!(events.recv().await, Ok(ConnectionEvent::Ready)));

        let stats = conn.stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 1);
        assert!(stats.connected_at.is_some());
    }

    #[tokio::test]
    async fn test_send_requires_open_connection() {
        let relay = TestRelay::start().await;
        let conn = Connection::new(&relay.url(), ConnectionOptions::default()).unwrap();

        let result = conn.send(&Envelope::Notice("hi".to_string())).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscription_delivery() {
        let (mut relay, conn) = connected_pair().await;

        let mut sub = conn
            .subscribe(
                vec![Filter {
                    kinds: Some(vec![Kind(1)]),
                    ..Default::default()
                }],
                SubscriptionParams {
                    id: Some("s1".to_string()),
                },
            )
            .await
            .unwrap();

        // the REQ went out first
        let req = relay.recv().await;
        assert!(req.starts_with(r#"["REQ","s1""#), "unexpected frame: {req}");

        // a matching event is delivered
        let matching = kind1_event("hello");
        relay.send(
            serde_json::to_string(&Envelope::EventIn {
                subscription_id: "s1".to_string(),
                event: matching.clone(),
            })
            .unwrap(),
        );

        // a non-matching one is dropped silently
        let other = EventTemplate {
            created_at: Timestamp(1750711742),
            kind: Kind(2),
            tags: Tags::default(),
            content: "nope".to_string(),
        }
        .finalize(&SecretKey::generate());
        relay.send(
            serde_json::to_string(&Envelope::EventIn {
                subscription_id: "s1".to_string(),
                event: other,
            })
            .unwrap(),
        );

        relay.send(r#"["EOSE","s1"]"#);
        relay.send(r#"["CLOSED","s1","rate-limited"]"#);

        match sub.recv().await {
            Some(SubscriptionUpdate::Event(event)) => assert_eq!(event, matching),
            got => panic!("expected the matching event, got {got:?}"),
        }
        assert!(matches!(
            sub.recv().await,
            Some(SubscriptionUpdate::EndOfStored)
        ));
        match sub.recv().await {
            Some(SubscriptionUpdate::Closed(reason)) => assert_eq!(reason, "rate-limited"),
            got => panic!("expected a close, got {got:?}"),
        }

        // CLOSED removed the registry entry; nothing further arrives
        assert!(conn.inner.subscriptions.get("s1").is_none());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_ok_correlation() {
        let (mut relay, conn) = connected_pair().await;

        let event = kind1_event("to store");
        let event_id = event.id;

        let publishing = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.publish(event).await })
        };

        let frame = relay.recv().await;
        assert!(frame.starts_with(r#"["EVENT""#));

        relay.send(format!(r#"["OK","{}",true,"stored"]"#, event_id.to_hex()));
        assert_eq!(publishing.await.unwrap().unwrap(), "stored");
        assert!(conn.inner.publish_waiters.is_empty());

        // a second OK for the same id is ignored
        relay.send(format!(r#"["OK","{}",true,"again"]"#, event_id.to_hex()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.inner.publish_waiters.is_empty());
    }

    #[tokio::test]
    async fn test_publish_rejection() {
        let (mut relay, conn) = connected_pair().await;

        let event = kind1_event("spam");
        let event_id = event.id;

        let publishing = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.publish(event).await })
        };
        let _ = relay.recv().await;

        relay.send(format!(
            r#"["OK","{}",false,"blocked: spam"]"#,
            event_id.to_hex()
        ));
        match publishing.await.unwrap() {
            Err(ConnectionError::Rejected(reason)) => assert_eq!(reason, "blocked: spam"),
            got => panic!("expected a rejection, got {got:?}"),
        }
    }

    #[tokio::test]
    async fn test_count_correlation() {
        let (mut relay, conn) = connected_pair().await;

        let counting = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.count(vec![Filter {
                    kinds: Some(vec![Kind(1)]),
                    ..Default::default()
                }])
                .await
            })
        };

        let frame = relay.recv().await;
        let envelope: Envelope = serde_json::from_str(&frame).unwrap();
        let id = match envelope {
            Envelope::CountAsk {
                subscription_id, ..
            } => subscription_id,
            got => panic!("expected a COUNT, got {got:?}"),
        };
        assert!(id.starts_with("count:"));

        relay.send(format!(r#"["COUNT","{}",{{"count":42}}]"#, id));
        assert_eq!(counting.await.unwrap().unwrap(), 42);
        assert!(conn.inner.count_waiters.is_empty());
    }

    #[tokio::test]
    async fn test_serials_are_strictly_increasing_and_registries_disjoint() {
        let relay = TestRelay::start().await;
        let conn = Connection::new(&relay.url(), ConnectionOptions::default()).unwrap();

        let a = conn.prepare_subscription(vec![Filter::new()], SubscriptionParams::default());
        let b = conn.prepare_subscription(vec![Filter::new()], SubscriptionParams::default());
        let c = conn.prepare_subscription(vec![Filter::new()], SubscriptionParams::default());

        assert_eq!(a.id(), "sub:0");
        assert_eq!(b.id(), "sub:1");
        assert_eq!(c.id(), "sub:2");

        // count ids draw from the same serial but live in their own registry
        let count_id = format!("count:{}", conn.next_serial());
        assert_eq!(count_id, "count:3");
        assert!(conn.inner.subscriptions.get(&count_id).is_none());
        assert!(conn.inner.count_waiters.get(a.id()).is_none());
    }

    #[tokio::test]
    async fn test_teardown_rejects_pending_and_notifies_subscriptions() {
        let (mut relay, conn) = connected_pair().await;

        let mut sub = conn
            .subscribe(vec![Filter::new()], SubscriptionParams::default())
            .await
            .unwrap();
        let _ = relay.recv().await;

        let event = kind1_event("never acked");
        let publishing = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.publish(event).await })
        };
        let _ = relay.recv().await;

        // sessions shorter than a few ms round to zero-length durations
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.kick();

        match publishing.await.unwrap() {
            Err(ConnectionError::ConnectionClosed) => {}
            got => panic!("expected ConnectionClosed, got {got:?}"),
        }
        match sub.recv().await {
            Some(SubscriptionUpdate::Closed(reason)) => assert_eq!(reason, "connection closed"),
            got => panic!("expected a close update, got {got:?}"),
        }

        assert!(conn.inner.publish_waiters.is_empty());
        assert!(conn.inner.subscriptions.is_empty());

        // the session length was recorded exactly once
        let stats = conn.stats();
        assert_eq!(stats.durations.len(), 1);
        assert!(stats.durations[0] >= Duration::from_millis(10));
        assert!(stats.connected_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_failure_backoff_schedule() {
        // a port nobody listens on: bind, grab the address, drop the listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(&format!("ws://{}", addr), ConnectionOptions::default()).unwrap();
        let mut events = conn.events();

        assert!(conn.connect().await.is_err());

        let mut delays = Vec::new();
        while delays.len() < 5 {
            match events.recv().await {
                Ok(ConnectionEvent::DelayedConnect(delay)) => delays.push(delay.as_millis()),
                Ok(_) => {}
                Err(err) => panic!("event stream ended early: {err}"),
            }
        }
        assert_eq!(delays, vec![5000, 10000, 15000, 20000, 25000]);

        // after attempt 5, nothing further is scheduled
        let quiet = tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::DelayedConnect(_)) => break false,
                    Ok(_) => {}
                    Err(_) => break true,
                }
            }
        })
        .await;
        assert!(
            !matches!(quiet, Ok(false)),
            "a sixth reconnect attempt was scheduled"
        );
    }

    #[tokio::test]
    async fn test_flapping_sets_status_and_emits_once() {
        let relay = TestRelay::start().await;
        let conn = Connection::new(&relay.url(), ConnectionOptions::default()).unwrap();
        let mut events = conn.events();

        {
            let mut stats = conn.inner.stats.lock().unwrap();
            stats.durations = vec![
                Duration::from_millis(500),
                Duration::from_millis(600),
                Duration::from_millis(550),
            ];
        }

        conn.schedule_reconnect().await;

        assert_eq!(conn.status().await, Status::Flapping);
        assert!(conn.inner.reconnect_timer.lock().unwrap().is_none());

        match events.recv().await {
            Ok(ConnectionEvent::Flapping(stats)) => assert_eq!(stats.durations.len(), 3),
            got => panic!("expected a flapping event, got {got:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notice_triggers_recycle() {
        let (relay, conn) = connected_pair().await;
        let mut events = conn.events();

        relay.send(r#"["NOTICE","Too many concurrent subs"]"#);

        match events.recv().await {
            Ok(ConnectionEvent::Notice(text)) => assert_eq!(text, "Too many concurrent subs"),
            got => panic!("expected the notice, got {got:?}"),
        }

        // the connection drops, then comes back roughly two seconds later
        let deadline = Instant::now() + Duration::from_secs(5);
        while relay.accepted() < 2 {
            assert!(Instant::now() < deadline, "connection did not come back");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn test_plain_notice_does_not_recycle() {
        let (relay, conn) = connected_pair().await;
        let mut events = conn.events();

        relay.send(r#"["NOTICE","welcome"]"#);
        match events.recv().await {
            Ok(ConnectionEvent::Notice(text)) => assert_eq!(text, "welcome"),
            got => panic!("expected the notice, got {got:?}"),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.status().await, Status::Connected);
        assert_eq!(relay.accepted(), 1);
    }

    #[tokio::test]
    async fn test_auth_challenge_without_policy_is_surfaced() {
        let (relay, conn) = connected_pair().await;
        let mut events = conn.events();

        relay.send(r#"["AUTH","challenge-123"]"#);

        match events.recv().await {
            Ok(ConnectionEvent::AuthRequired(challenge)) => assert_eq!(challenge, "challenge-123"),
            got => panic!("expected an auth-required event, got {got:?}"),
        }
        assert_eq!(conn.status().await, Status::Connected);
    }

    #[tokio::test]
    async fn test_auth_challenge_with_default_signing_policy() {
        let relay = TestRelay::start().await;
        let signer = SecretKey::generate();
        let conn = Connection::new(
            &relay.url(),
            ConnectionOptions {
                auth_policy: Some(Arc::new(|_url, _challenge| AuthDecision::SignChallenge)),
                signer: Some(signer),
                ..Default::default()
            },
        )
        .unwrap();
        let mut events = conn.events();
        conn.connect().await.unwrap();

        let mut relay = relay;
        relay.send(r#"["AUTH","chal-9"]"#);

        // the signed kind-22242 event goes out as an AUTH frame
        let frame = relay.recv().await;
        let envelope: Envelope = serde_json::from_str(&frame).unwrap();
        let event = match envelope {
            Envelope::AuthEvent { event } => event,
            got => panic!("expected an AUTH event, got {got:?}"),
        };
        assert_eq!(event.kind, Kind::CLIENT_AUTH);
        assert_eq!(event.pubkey, signer.public_key());
        assert!(event.verify_signature());
        assert_eq!(event.tags.value_of("challenge"), Some("chal-9"));
        let relay_url = conn.url().to_string();
        assert_eq!(event.tags.value_of("relay"), Some(relay_url.as_str()));
        assert_eq!(conn.status().await, Status::Authenticating);

        relay.send(format!(r#"["OK","{}",true,""]"#, event.id.to_hex()));

        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Authed) => break,
                Ok(_) => {}
                Err(err) => panic!("event stream ended early: {err}"),
            }
        }
        assert_eq!(conn.status().await, Status::Authenticated);
        assert!(conn.status().await.is_open());
    }
}

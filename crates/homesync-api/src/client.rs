//! Hub WebSocket client with request correlation and auto-reconnect.
//!
//! Owns the single live connection to the hub: performs the
//! `auth_required` / `auth` / `auth_ok` handshake, stamps every request
//! with a process-unique id and parks the caller until the matching
//! `result` frame arrives, and fans `state_changed` events out to
//! per-entity subscribers. On transport loss the connection is torn down
//! and rebuilt with exponential backoff.
//!
//! # Example
//!
//! ```rust,ignore
//! use homesync_api::{ClientConfig, HubClient};
//! use secrecy::SecretString;
//!
//! let url = "ws://homeassistant.local:8123/api/websocket".parse()?;
//! let client = HubClient::new(ClientConfig::new(url, SecretString::from(token)));
//! client.connect().await?;
//!
//! let _sub = client.subscribe_to_entity("input_boolean.tv_on", |entity, _old, new| {
//!     println!("{entity} -> {:?}", new.map(|s| &s.state));
//! });
//! client.set_input_boolean("tv_on", true).await?;
//!
//! client.disconnect().await;
//! ```

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::backoff::ReconnectConfig;
use crate::error::Error;
use crate::registry::{EntityHandler, EntitySubscription, SubscriptionRegistry};
use crate::wire::{
    AuthMessage, EntityState, Request, RequestFrame, STATE_CHANGED, ServerMessage,
    StateChangedData,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Deadline for a single correlated request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── ClientConfig ─────────────────────────────────────────────────────

/// How to reach and authenticate with the hub.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://hub.local:8123/api/websocket`.
    pub url: Url,
    /// Long-lived access token sent in the `auth` frame.
    pub token: SecretString,
    /// Per-request deadline. Default: 10s.
    pub request_timeout: Duration,
    /// Backoff policy applied after a transport failure.
    pub reconnect: ReconnectConfig,
    /// Rebuild the connection automatically after transport loss.
    pub auto_reconnect: bool,
}

impl ClientConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            auto_reconnect: true,
        }
    }
}

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
}

// ── HubClient ────────────────────────────────────────────────────────

/// The protocol client.
///
/// Cheaply cloneable via `Arc<ClientInner>`. Every clone drives the same
/// connection, pending-request table, and subscriber registry.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    /// Serializes connect / disconnect / teardown.
    lifecycle: Mutex<()>,
    /// Write half of the socket. Its lock keeps request frames from
    /// concurrent callers from interleaving.
    writer: Mutex<Option<WsSink>>,
    pending: DashMap<u64, oneshot::Sender<ServerMessage>>,
    next_request_id: AtomicU64,
    subscriptions: Arc<SubscriptionRegistry>,
    /// Per-connection context, cancelled on teardown.
    session: SyncMutex<CancellationToken>,
    /// Cancelled by `disconnect()` to stop pending reconnect loops.
    shutdown: SyncMutex<CancellationToken>,
    reconnect_enabled: AtomicBool,
}

impl HubClient {
    /// Create a client. Does NOT connect -- call [`connect()`](Self::connect).
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let session = CancellationToken::new();
        session.cancel();

        Self {
            inner: Arc::new(ClientInner {
                reconnect_enabled: AtomicBool::new(config.auto_reconnect),
                config,
                state,
                lifecycle: Mutex::new(()),
                writer: Mutex::new(None),
                pending: DashMap::new(),
                next_request_id: AtomicU64::new(0),
                subscriptions: Arc::new(SubscriptionRegistry::new()),
                session: SyncMutex::new(session),
                shutdown: SyncMutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open the socket, authenticate, and start the receive loop.
    ///
    /// Also re-arms automatic reconnection if a previous
    /// [`disconnect()`](Self::disconnect) suppressed it. Failing to
    /// subscribe to `state_changed` afterwards is logged, not returned.
    pub async fn connect(&self) -> Result<(), Error> {
        let shutdown = {
            let mut shutdown = self.inner.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
            shutdown.clone()
        };
        self.inner
            .reconnect_enabled
            .store(self.inner.config.auto_reconnect, Ordering::SeqCst);

        self.establish(&shutdown).await
    }

    async fn establish(&self, shutdown: &CancellationToken) -> Result<(), Error> {
        let lifecycle = self.inner.lifecycle.lock().await;

        if shutdown.is_cancelled() {
            return Err(Error::Disconnected);
        }
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        self.inner.state.send_replace(ConnectionState::Authenticating);
        let (sink, source, hub_version) = match handshake(&self.inner.config).await {
            Ok(parts) => parts,
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let session = CancellationToken::new();
        *self.inner.session.lock() = session.clone();
        *self.inner.writer.lock().await = Some(sink);
        self.inner.state.send_replace(ConnectionState::Connected);
        info!(
            url = %self.inner.config.url,
            hub_version = hub_version.as_deref().unwrap_or("unknown"),
            "connected to hub"
        );

        tokio::spawn(receive_loop(self.clone(), source, session));
        drop(lifecycle);

        if let Err(e) = self.subscribe_events(STATE_CHANGED).await {
            warn!(error = %e, "failed to subscribe to state_changed events");
        }
        Ok(())
    }

    /// Close the connection and suppress automatic reconnection.
    ///
    /// On a live connection: cancels the connection context, which
    /// unblocks every in-flight request with [`Error::Disconnected`],
    /// sends a close frame best-effort (bounded by the request timeout),
    /// and clears all entity subscriptions. Without a live connection
    /// it only stops pending reconnects and leaves subscriptions alone.
    pub async fn disconnect(&self) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        self.inner.shutdown.lock().cancel();

        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_connected() {
            // Never connected, or between reconnect attempts: only the
            // reconnect suppression above applies.
            if matches!(*self.inner.state.borrow(), ConnectionState::Reconnecting { .. }) {
                self.inner.state.send_replace(ConnectionState::Disconnected);
            }
            return;
        }
        // Cancelling first releases any writer blocked on a stalled peer.
        self.inner.session.lock().cancel();

        let closing = async {
            let Some(mut sink) = self.inner.writer.lock().await.take() else {
                return;
            };
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(e) = sink.send(close).await {
                debug!(error = %e, "close frame not delivered");
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(self.inner.config.request_timeout, closing)
            .await
            .is_err()
        {
            debug!("hub did not accept close frame in time");
            if let Ok(mut writer) = self.inner.writer.try_lock() {
                writer.take();
            }
        }

        self.inner.subscriptions.clear();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!("disconnected from hub");
    }

    /// Tear down after a read/write failure and schedule a reconnect.
    ///
    /// `session` identifies the connection that failed; a stale or
    /// already-cancelled session makes this a no-op.
    async fn connection_lost(&self, session: &CancellationToken) {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if session.is_cancelled() {
                return;
            }
            session.cancel();
            self.inner.writer.lock().await.take();
            self.inner.subscriptions.clear();
            self.inner.state.send_replace(ConnectionState::Disconnected);
        }

        warn!("connection to hub lost");

        if self.inner.reconnect_enabled.load(Ordering::SeqCst) {
            tokio::spawn(self.clone().reconnect_task());
        }
    }

    /// [`reconnect_loop`](Self::reconnect_loop) behind a named `Send`
    /// future, breaking the receive loop / reconnect / establish cycle.
    fn reconnect_task(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.reconnect_loop())
    }

    async fn reconnect_loop(self) {
        let shutdown = self.inner.shutdown.lock().clone();
        let policy = self.inner.config.reconnect.clone();

        for (attempt, delay) in (1u32..).zip(policy.delays()) {
            if let Some(max) = policy.max_retries {
                if attempt > max {
                    error!(max_retries = max, "reconnection limit reached, giving up");
                    return;
                }
            }
            if shutdown.is_cancelled() {
                return;
            }

            self.inner
                .state
                .send_replace(ConnectionState::Reconnecting { attempt });
            info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "waiting before reconnect"
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            match self.establish(&shutdown).await {
                Ok(()) => {
                    info!(attempt, "reconnected to hub");
                    return;
                }
                Err(Error::AlreadyConnected | Error::Disconnected) => return,
                Err(e) => warn!(error = %e, attempt, "reconnection attempt failed"),
            }
        }
    }

    // ── State observation ────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of live subscribers for one entity.
    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.inner.subscriptions.subscriber_count(entity_id)
    }

    // ── Request / response ───────────────────────────────────────────

    /// Send a correlated request and wait for its `result` frame.
    ///
    /// Resolves with the `result` payload, [`Error::Remote`] when the hub
    /// reports failure, [`Error::Timeout`] after the configured deadline,
    /// or [`Error::Disconnected`] if the connection goes away first. The
    /// pending entry is removed on every path, including cancellation of
    /// the returned future.
    pub async fn send_request(&self, request: &Request) -> Result<Value, Error> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        let session = self.inner.session.lock().clone();

        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let _pending = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        let frame = encode(&RequestFrame { id, request })?;
        debug!(request_id = id, kind = request.label(), "sending request");

        // A peer that stops reading can block the write; teardown must
        // still be able to interrupt it.
        let written = tokio::select! {
            biased;
            _ = session.cancelled() => return Err(Error::Disconnected),
            written = self.write_frame(frame) => written,
        };
        match written {
            Ok(()) => {}
            Err(Error::Disconnected) => return Err(Error::Disconnected),
            Err(e) => {
                warn!(error = %e, request_id = id, "failed to write request");
                self.connection_lost(&session).await;
                return Err(e);
            }
        }

        let timeout = self.inner.config.request_timeout;
        tokio::select! {
            biased;
            _ = session.cancelled() => Err(Error::Disconnected),
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(message)) => message.into_result(),
                Ok(Err(_)) => Err(Error::Disconnected),
                Err(_) => {
                    debug!(request_id = id, "request timed out");
                    Err(Error::Timeout { timeout_secs: timeout.as_secs() })
                }
            },
        }
    }

    async fn write_frame(&self, frame: String) -> Result<(), Error> {
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::Disconnected)?;
        sink.send(Message::text(frame)).await?;
        Ok(())
    }

    async fn subscribe_events(&self, event_type: &str) -> Result<(), Error> {
        self.send_request(&Request::SubscribeEvents {
            event_type: Some(event_type.to_owned()),
        })
        .await
        .map(drop)
    }

    /// Fetch a snapshot of every entity the hub knows about.
    pub async fn get_states(&self) -> Result<Vec<EntityState>, Error> {
        let result = self.send_request(&Request::GetStates).await?;
        serde_json::from_value(result.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: result.to_string(),
        })
    }

    /// Fetch a single entity. Reports a missing entity as
    /// [`Error::Remote`] with code `not_found`.
    pub async fn get_state(&self, entity_id: &str) -> Result<EntityState, Error> {
        self.get_states()
            .await?
            .into_iter()
            .find(|state| state.entity_id == entity_id)
            .ok_or_else(|| Error::Remote {
                code: "not_found".into(),
                message: format!("entity {entity_id} not found"),
            })
    }

    /// Invoke a hub service, e.g. `light.turn_on`.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Map<String, Value>,
    ) -> Result<(), Error> {
        self.send_request(&Request::CallService {
            domain: domain.to_owned(),
            service: service.to_owned(),
            service_data,
        })
        .await
        .map(drop)
    }

    // ── Typed helper writes ──────────────────────────────────────────

    pub async fn set_input_boolean(&self, name: &str, value: bool) -> Result<(), Error> {
        let service = if value { "turn_on" } else { "turn_off" };
        self.call_service(
            "input_boolean",
            service,
            service_data(format!("input_boolean.{name}"), None),
        )
        .await
    }

    pub async fn set_input_number(&self, name: &str, value: f64) -> Result<(), Error> {
        self.call_service(
            "input_number",
            "set_value",
            service_data(format!("input_number.{name}"), Some(json!(value))),
        )
        .await
    }

    pub async fn set_input_text(&self, name: &str, value: &str) -> Result<(), Error> {
        self.call_service(
            "input_text",
            "set_value",
            service_data(format!("input_text.{name}"), Some(json!(value))),
        )
        .await
    }

    // ── Entity subscriptions ─────────────────────────────────────────

    /// Register a local listener for `state_changed` events on one entity.
    ///
    /// No network round trip. The registration lives until
    /// [`EntitySubscription::unsubscribe`] or until the connection is torn
    /// down (disconnect or transport loss), after which callers must
    /// subscribe again.
    pub fn subscribe_to_entity<F>(&self, entity_id: &str, handler: F) -> EntitySubscription
    where
        F: Fn(&str, Option<&EntityState>, Option<&EntityState>) + Send + Sync + 'static,
    {
        let handler: EntityHandler = Arc::new(handler);
        let id = self.inner.subscriptions.add(entity_id, handler);
        trace!(entity_id, subscription_id = id, "entity subscription added");
        EntitySubscription::new(entity_id.to_owned(), id, &self.inner.subscriptions)
    }

    // ── Inbound routing ──────────────────────────────────────────────

    fn route_frame(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "failed to parse hub frame");
                return;
            }
        };

        if message.is_event() {
            self.dispatch_event(message);
            return;
        }

        let Some(id) = message.id else {
            trace!(kind = %message.kind, "ignoring uncorrelated frame");
            return;
        };

        match self.inner.pending.remove(&id) {
            Some((_, tx)) => {
                if tx.send(message).is_err() {
                    debug!(request_id = id, "requester gone, dropping response");
                }
            }
            None => debug!(request_id = id, "no pending request for response"),
        }
    }

    fn dispatch_event(&self, message: ServerMessage) {
        let Some(event) = message.event else {
            return;
        };
        if event.event_type != STATE_CHANGED {
            trace!(event_type = %event.event_type, "ignoring event");
            return;
        }

        let data: StateChangedData = match serde_json::from_value(event.data) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to decode state_changed event");
                return;
            }
        };

        let handlers = self.inner.subscriptions.snapshot(&data.entity_id);
        trace!(entity_id = %data.entity_id, subscribers = handlers.len(), "state_changed");

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler(
                    &data.entity_id,
                    data.old_state.as_ref(),
                    data.new_state.as_ref(),
                );
            }));
            if outcome.is_err() {
                error!(entity_id = %data.entity_id, "entity subscriber panicked");
            }
        }
    }
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("url", &self.inner.config.url.as_str())
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Removes a pending-request entry when the request settles or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<ServerMessage>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

// ── Background receive loop ──────────────────────────────────────────

/// Read frames until the session is cancelled or the socket fails.
async fn receive_loop(client: HubClient, mut source: WsSource, session: CancellationToken) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = session.cancelled() => {
                debug!("receive loop exiting");
                return;
            }
            frame = source.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => client.route_frame(text.as_str()),
            Some(Ok(Message::Ping(_))) => {
                // tungstenite queues the pong reply itself
                trace!("hub ping");
            }
            Some(Ok(Message::Close(frame))) => {
                if let Some(ref cf) = frame {
                    info!(code = %cf.code, reason = %cf.reason, "hub closed the connection");
                } else {
                    info!("hub closed the connection");
                }
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to read from hub");
                break;
            }
            None => {
                info!("hub stream ended");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    client.connection_lost(&session).await;
}

// ── Handshake ────────────────────────────────────────────────────────

async fn handshake(
    config: &ClientConfig,
) -> Result<(WsSink, WsSource, Option<String>), Error> {
    debug!(url = %config.url, "opening hub connection");
    let (stream, _response) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
    let (mut sink, mut source) = stream.split();

    let required = read_frame(&mut source, config.request_timeout).await?;
    if required.kind != "auth_required" {
        return Err(Error::Transport {
            message: format!("expected auth_required, got {}", required.kind),
        });
    }

    let auth = encode(&AuthMessage::new(config.token.expose_secret()))?;
    sink.send(Message::text(auth)).await?;

    let reply = read_frame(&mut source, config.request_timeout).await?;
    match reply.kind.as_str() {
        "auth_ok" => Ok((sink, source, reply.ha_version)),
        "auth_invalid" => Err(Error::Authentication {
            message: reply
                .message
                .unwrap_or_else(|| "invalid access token".into()),
        }),
        other => Err(Error::Transport {
            message: format!("expected auth_ok, got {other}"),
        }),
    }
}

/// Read the next text frame, skipping control frames.
async fn read_frame(source: &mut WsSource, deadline: Duration) -> Result<ServerMessage, Error> {
    let read = async {
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerMessage>(text.as_str()).map_err(|e| {
                        Error::Deserialization {
                            message: e.to_string(),
                            body: text.to_string(),
                        }
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::Transport {
                        message: "connection closed during handshake".into(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    };

    tokio::time::timeout(deadline, read)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: deadline.as_secs(),
        })?
}

fn encode<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: String::new(),
    })
}

fn service_data(entity_id: String, value: Option<Value>) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("entity_id".into(), Value::String(entity_id));
    if let Some(value) = value {
        data.insert("value".into(), value);
    }
    data
}

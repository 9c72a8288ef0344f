//! Connection: one WebSocket to one daemon.
//!
//! Owns the handshake, request/response correlation, keepalive, reconnection
//! backoff and dead-socket detection for a single server. Every change of
//! [`ConnectionState`] goes through [`ConnectionState::apply`], so the status
//! can only move along the edges listed there.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{PayloadCodec, PlainCodec};
use crate::config::{ConnectionConfig, ServerConfig};
use crate::error::{RequestError, TransitionError};
use crate::protocol::{self, InboundFrame, OutboundFrame};
use crate::pubsub::{Subscribers, Subscription, lock};
use crate::queue::MessageQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// User-facing description of the last failure (set in `Error`).
    pub error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            error: None,
            last_connected_at: None,
            reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionTransition {
    /// disconnected|error → connecting (explicit connect/retry, attempts reset);
    /// reconnecting → connecting (backoff elapsed, attempts kept)
    Connect,
    /// connecting → connected
    Authenticated { at: DateTime<Utc> },
    /// connecting|reconnecting → error
    AuthFailed { message: String },
    /// connecting|connected → reconnecting (`can_retry`) or error
    SocketLost { reason: String, can_retry: bool },
    /// any → disconnected
    Disconnect,
}

impl ConnectionTransition {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Authenticated { .. } => "complete authentication",
            Self::AuthFailed { .. } => "fail authentication",
            Self::SocketLost { .. } => "lose the socket",
            Self::Disconnect => "disconnect",
        }
    }
}

impl ConnectionState {
    pub fn apply(&self, transition: ConnectionTransition) -> Result<Self, TransitionError> {
        use ConnectionStatus::*;
        use ConnectionTransition::*;

        match (self.status, transition) {
            (_, Disconnect) => Ok(Self {
                status: Disconnected,
                error: None,
                last_connected_at: self.last_connected_at,
                reconnect_attempts: 0,
            }),

            (Disconnected | Error, Connect) => Ok(Self {
                status: Connecting,
                error: None,
                last_connected_at: self.last_connected_at,
                reconnect_attempts: 0,
            }),
            (Reconnecting, Connect) => Ok(Self {
                status: Connecting,
                ..self.clone()
            }),

            (Connecting, Authenticated { at }) => Ok(Self {
                status: Connected,
                error: None,
                last_connected_at: Some(at),
                reconnect_attempts: 0,
            }),

            (Connecting | Reconnecting, AuthFailed { message }) => Ok(Self {
                status: Error,
                error: Some(message),
                ..self.clone()
            }),

            (Connecting | Connected, SocketLost { can_retry: true, .. }) => Ok(Self {
                status: Reconnecting,
                error: None,
                last_connected_at: self.last_connected_at,
                reconnect_attempts: self.reconnect_attempts + 1,
            }),
            (Connecting | Connected, SocketLost { reason, can_retry: false }) => Ok(Self {
                status: Error,
                error: Some(format!(
                    "Connection lost after {} reconnect attempts: {}",
                    self.reconnect_attempts, reason
                )),
                ..self.clone()
            }),

            (from, transition) => Err(TransitionError::InvalidTransition {
                from,
                transition: transition.name(),
            }),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `initial * 2^(attempt-1)`,
/// capped at `max`. Non-decreasing in `attempt`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial
        .checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

struct PendingRequest {
    request_type: String,
    deadline: Instant,
    tx: oneshot::Sender<Result<InboundFrame, RequestError>>,
}

struct SocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl SocketHandle {
    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }
}

type StateHandler = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// A state change waiting to be handed to subscribers.
enum StateDelivery {
    All(ConnectionState),
    /// Replay of the current state to one new subscriber.
    One(StateHandler, ConnectionState),
}

struct Shared {
    server: Option<ServerConfig>,
    state: ConnectionState,
    pending: HashMap<String, PendingRequest>,
    socket: Option<SocketHandle>,
    /// Bumped for every connect attempt and every teardown. Socket tasks and
    /// backoff timers carry the generation they were started under and go
    /// inert once it is no longer current.
    generation: u64,
    reconnect_timer: Option<CancellationToken>,
    /// Committed states in commit order. Filled under this lock and emptied
    /// by a single deliverer at a time, so subscribers see every change in
    /// the order it was applied.
    outbox: VecDeque<StateDelivery>,
    delivering: bool,
}

impl Shared {
    fn transition(&mut self, transition: ConnectionTransition) -> Option<ConnectionState> {
        match self.state.apply(transition) {
            Ok(next) if next == self.state => None,
            Ok(next) => {
                self.state = next.clone();
                self.outbox.push_back(StateDelivery::All(next.clone()));
                Some(next)
            }
            Err(e) => {
                debug!(
                    server = %self.server_id(),
                    "ignoring transition: {}", e
                );
                None
            }
        }
    }

    fn server_id(&self) -> &str {
        self.server.as_ref().map(|s| s.id.as_str()).unwrap_or("-")
    }

    /// Close the socket and cancel any scheduled reconnect. Returns the
    /// pending requests, which the caller must reject after unlocking.
    fn teardown(&mut self) -> Vec<PendingRequest> {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
        if let Some(socket) = self.socket.take() {
            socket.cancel.cancel();
        }
        self.pending.drain().map(|(_, p)| p).collect()
    }
}

fn reject_all(pending: Vec<PendingRequest>) {
    let now = Instant::now();
    for request in pending {
        trace!(
            request_type = %request.request_type,
            remaining = ?request.deadline.saturating_duration_since(now),
            "rejecting pending request"
        );
        let _ = request.tx.send(Err(RequestError::ConnectionLost));
    }
}

/// Releases the deliverer slot if a state handler panics mid-delivery.
struct DeliveryReset<'a>(&'a Inner);

impl Drop for DeliveryReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(&self.0.shared).delivering = false;
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    codec: Arc<dyn PayloadCodec>,
    queue: Option<MessageQueue>,
    shared: Mutex<Shared>,
    state_subs: Subscribers<ConnectionState>,
    message_subs: Subscribers<InboundFrame>,
}

/// Handle to one per-server connection. Cheap to clone; all clones share
/// the same socket and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = lock(&self.inner.shared);
        f.debug_struct("Connection")
            .field("server", &shared.server_id())
            .field("status", &shared.state.status)
            .field("pending", &shared.pending.len())
            .finish()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_parts(config, Arc::new(PlainCodec), None)
    }

    /// `queue`, when given, is drained for this server after every successful
    /// authentication.
    pub fn with_parts(
        config: ConnectionConfig,
        codec: Arc<dyn PayloadCodec>,
        queue: Option<MessageQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                queue,
                shared: Mutex::new(Shared {
                    server: None,
                    state: ConnectionState::default(),
                    pending: HashMap::new(),
                    socket: None,
                    generation: 0,
                    reconnect_timer: None,
                    outbox: VecDeque::new(),
                    delivering: false,
                }),
                state_subs: Subscribers::new(),
                message_subs: Subscribers::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).state.clone()
    }

    pub fn server(&self) -> Option<ServerConfig> {
        lock(&self.inner.shared).server.clone()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.shared).pending.len()
    }

    /// Whether the underlying socket is actually usable, regardless of
    /// what the state claims.
    pub fn is_socket_open(&self) -> bool {
        lock(&self.inner.shared)
            .socket
            .as_ref()
            .is_some_and(SocketHandle::is_open)
    }

    pub fn is_connected(&self) -> bool {
        let shared = lock(&self.inner.shared);
        shared.state.status == ConnectionStatus::Connected
            && shared.socket.as_ref().is_some_and(SocketHandle::is_open)
    }

    /// Subscribe to state changes. The current state is delivered
    /// immediately, ordered after every change already committed.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: StateHandler = Arc::new(handler);
        let forward = handler.clone();
        let subscription = self.inner.state_subs.subscribe(move |state| forward(state));
        self.replay_state(handler);
        subscription
    }

    /// Queue the current state for `handler` behind any undelivered change.
    pub(crate) fn replay_state(&self, handler: StateHandler) {
        {
            let mut shared = lock(&self.inner.shared);
            let current = shared.state.clone();
            shared.outbox.push_back(StateDelivery::One(handler, current));
        }
        self.inner.flush_states();
    }

    /// Subscribe to inbound frames that do not answer a pending request.
    pub fn on_message(
        &self,
        handler: impl Fn(&InboundFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.message_subs.subscribe(handler)
    }

    /// Open (or keep) a connection to `server`. Must be called inside a
    /// tokio runtime.
    ///
    /// No-op when the server is disabled, when an attempt to the same server
    /// is already in flight, or when already connected over an open socket.
    /// Targeting a different server tears the current connection down first.
    pub fn connect(&self, server: ServerConfig) {
        if !server.enabled {
            debug!(server = %server.id, "server disabled, not connecting");
            return;
        }

        let needs_teardown = {
            let shared = lock(&self.inner.shared);
            let same = shared
                .server
                .as_ref()
                .is_some_and(|current| current.same_endpoint(&server));
            let open = shared.socket.as_ref().is_some_and(SocketHandle::is_open);
            match shared.state.status {
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting if same => return,
                ConnectionStatus::Connected if same && open => return,
                ConnectionStatus::Disconnected | ConnectionStatus::Error => false,
                _ => true,
            }
        };

        if needs_teardown {
            self.disconnect();
        }
        self.inner.start_attempt(server);
    }

    /// Close the socket, cancel any pending reconnect, and reject every
    /// outstanding request with [`RequestError::ConnectionLost`].
    pub fn disconnect(&self) {
        let (pending, changed) = {
            let mut shared = lock(&self.inner.shared);
            shared.generation += 1;
            let pending = shared.teardown();
            let changed = shared.transition(ConnectionTransition::Disconnect);
            if changed.is_some() {
                info!(server = %shared.server_id(), "disconnected");
            }
            (pending, changed)
        };
        reject_all(pending);
        if changed.is_some() {
            self.inner.flush_states();
        }
    }

    /// Explicit user retry: connect now with the attempt counter reset.
    pub fn reconnect(&self) {
        let server = {
            let mut shared = lock(&self.inner.shared);
            match shared.state.status {
                ConnectionStatus::Connecting | ConnectionStatus::Connected => return,
                ConnectionStatus::Reconnecting => {
                    if let Some(timer) = shared.reconnect_timer.take() {
                        timer.cancel();
                    }
                    shared.state.reconnect_attempts = 0;
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
            }
            shared.server.clone()
        };

        match server {
            Some(server) => self.inner.start_attempt(server),
            None => debug!("reconnect requested before any server was set"),
        }
    }

    /// Re-validate the connection after the host process was suspended.
    ///
    /// A `connected` state over a dead socket forces a full reconnect cycle;
    /// `error` and `reconnecting` retry immediately. Both reset the attempt
    /// counter.
    pub async fn check_health(&self) {
        let (status, open, server) = {
            let shared = lock(&self.inner.shared);
            (
                shared.state.status,
                shared.socket.as_ref().is_some_and(SocketHandle::is_open),
                shared.server.clone(),
            )
        };
        let Some(server) = server else {
            return;
        };

        match status {
            ConnectionStatus::Connected if !open => {
                warn!(server = %server.id, "state says connected but socket is dead, reconnecting");
                self.disconnect();
                self.inner.start_attempt(server);
            }
            ConnectionStatus::Connected if self.inner.config.probe_on_health_check => {
                if let Err(e) = self.probe().await {
                    if e.is_retryable() && self.state().status == ConnectionStatus::Connected {
                        warn!(server = %server.id, "health probe failed ({}), reconnecting", e);
                        self.disconnect();
                        self.inner.start_attempt(server);
                    }
                }
            }
            ConnectionStatus::Error | ConnectionStatus::Reconnecting => {
                info!(server = %server.id, status = %status, "health check retrying now");
                self.reconnect();
            }
            _ => {}
        }
    }

    /// Round-trip a `ping` request bounded by the health timeout.
    pub async fn probe(&self) -> Result<Duration, RequestError> {
        let started = Instant::now();
        self.ensure_connected()?;
        self.inner
            .request(protocol::PING, None, self.inner.config.health_timeout, true)
            .await?;
        Ok(started.elapsed())
    }

    /// Send a correlated request and wait for its response frame.
    ///
    /// `timeout` defaults to the configured request timeout. The response
    /// frame is returned as-is; use [`InboundFrame::into_result`] or
    /// [`InboundFrame::decode_payload`] to interpret `success`.
    pub async fn send_request(
        &self,
        request_type: &str,
        payload: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<InboundFrame, RequestError> {
        self.ensure_connected()?;
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        self.inner.request(request_type, payload, timeout, true).await
    }

    /// Fire-and-forget frame (no `requestId`).
    pub fn send(&self, kind: &str, payload: Option<Value>) -> Result<(), RequestError> {
        self.ensure_connected()?;
        let payload = match payload {
            Some(p) => Some(self.inner.codec.encode(p).map_err(RequestError::Codec)?),
            None => None,
        };
        let frame = OutboundFrame {
            payload,
            ..OutboundFrame::new(kind)
        };
        self.inner.write(&frame)
    }

    fn ensure_connected(&self) -> Result<(), RequestError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RequestError::NotConnected)
        }
    }
}

impl Inner {
    /// Hand queued state changes to subscribers, oldest first. Only one
    /// caller delivers at a time; others return and leave their entries to
    /// it. No lock is held while a handler runs.
    fn flush_states(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.delivering {
                return;
            }
            shared.delivering = true;
        }
        let _reset = DeliveryReset(self);
        loop {
            let next = {
                let mut shared = lock(&self.shared);
                match shared.outbox.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        shared.delivering = false;
                        return;
                    }
                }
            };
            match next {
                StateDelivery::All(state) => self.state_subs.notify(&state),
                StateDelivery::One(handler, state) => handler(&state),
            }
        }
    }

    fn start_attempt(self: &Arc<Self>, server: ServerConfig) {
        let attempt = {
            let mut shared = lock(&self.shared);
            if shared.transition(ConnectionTransition::Connect).is_none() {
                return;
            }
            shared.server = Some(server.clone());
            shared.generation += 1;
            let pending = shared.teardown();
            (shared.generation, CancellationToken::new(), pending)
        };
        let (generation, cancel, pending) = attempt;

        reject_all(pending);
        self.flush_states();

        let inner = self.clone();
        tokio::spawn(async move {
            inner.run_socket(generation, server, cancel).await;
        });
    }

    async fn run_socket(
        self: Arc<Self>,
        generation: u64,
        server: ServerConfig,
        cancel: CancellationToken,
    ) {
        let url = server.ws_url();
        info!(server = %server.id, url = %url, "connecting");

        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str())) => result,
        };
        let ws_stream = match opened {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.socket_lost(generation, format!("failed to open socket: {e}"));
                return;
            }
            Err(_) => {
                self.socket_lost(generation, "timed out opening socket".to_string());
                return;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                return;
            }
            shared.socket = Some(SocketHandle {
                outbound,
                cancel: cancel.clone(),
            });
        }

        // Writer: drain channel → socket
        let writer_cancel = cancel.clone();
        let writer_server = server.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(e) = ws_write.send(msg).await {
                                    error!(server = %writer_server, "socket write error: {}", e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        // Reader: socket → pending requests / broadcast subscribers
        let reader = self.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => reader.handle_text(generation, text.as_str()),
                            Some(Ok(Message::Close(frame))) => {
                                break match frame {
                                    Some(frame) => format!("closed by server: {}", frame.reason.as_str()),
                                    None => "closed by server".to_string(),
                                };
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break format!("socket error: {e}"),
                            None => break "socket closed".to_string(),
                        }
                    }
                }
            };
            reader.socket_lost(generation, reason);
        });

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.settle_delay) => {}
        }

        let payload = match serde_json::to_value(protocol::Authenticate {
            token: &server.token,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                self.auth_failed(generation, format!("Authentication failed: {e}"));
                return;
            }
        };

        match self
            .request(protocol::AUTHENTICATE, Some(payload), self.config.auth_timeout, false)
            .await
        {
            // The reader settled the outcome before resolving the request.
            Ok(_) => {}
            Err(RequestError::Timeout { .. }) => {
                self.auth_failed(
                    generation,
                    "Authentication failed: no response from server".to_string(),
                );
            }
            // The close handler owns this case.
            Err(RequestError::ConnectionLost | RequestError::NotConnected) => {}
            Err(e) => self.auth_failed(generation, format!("Authentication failed: {e}")),
        }
    }

    fn authenticated(self: &Arc<Self>, generation: u64) {
        let keepalive = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                return;
            }
            let Some(socket) = shared.socket.as_ref().filter(|s| s.is_open()) else {
                return;
            };
            let keepalive = (socket.outbound.clone(), socket.cancel.clone());
            if shared
                .transition(ConnectionTransition::Authenticated { at: Utc::now() })
                .is_none()
            {
                return;
            }
            info!(server = %shared.server_id(), "authenticated");
            keepalive
        };

        self.spawn_keepalive(keepalive.0, keepalive.1);
        self.flush_states();

        if let Some(queue) = &self.queue {
            let queue = queue.clone();
            let connection = Connection {
                inner: self.clone(),
            };
            tokio::spawn(async move {
                queue.drain(&connection).await;
            });
        }
    }

    fn auth_failed(&self, generation: u64, message: String) {
        let (pending, changed) = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                return;
            }
            warn!(server = %shared.server_id(), "{}", message);
            let pending = shared.teardown();
            (pending, shared.transition(ConnectionTransition::AuthFailed { message }))
        };
        reject_all(pending);
        if changed.is_some() {
            self.flush_states();
        }
    }

    /// Close handler: the sole authority for leaving `connected`.
    fn socket_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let (pending, changed) = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                return;
            }
            let pending = shared.teardown();
            if !matches!(
                shared.state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            ) {
                drop(shared);
                reject_all(pending);
                return;
            }

            let enabled = shared.server.as_ref().is_some_and(|s| s.enabled);
            let attempts = shared.state.reconnect_attempts;
            let can_retry = enabled
                && self
                    .config
                    .max_reconnect_attempts
                    .is_none_or(|max| attempts < max);

            let changed = shared.transition(ConnectionTransition::SocketLost {
                reason: reason.clone(),
                can_retry,
            });

            if can_retry {
                let attempt = shared.state.reconnect_attempts;
                let delay =
                    backoff_delay(attempt, self.config.initial_backoff, self.config.max_backoff);
                info!(
                    server = %shared.server_id(),
                    attempt = attempt,
                    delay = ?delay,
                    "connection lost ({}), will reconnect", reason
                );
                let timer = CancellationToken::new();
                shared.reconnect_timer = Some(timer.clone());
                let inner = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        _ = tokio::time::sleep(delay) => inner.backoff_elapsed(generation),
                    }
                });
            } else {
                warn!(server = %shared.server_id(), "connection lost ({}), giving up", reason);
            }

            (pending, changed)
        };

        reject_all(pending);
        if changed.is_some() {
            self.flush_states();
        }
    }

    fn backoff_elapsed(self: &Arc<Self>, generation: u64) {
        let server = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation
                || shared.state.status != ConnectionStatus::Reconnecting
            {
                return;
            }
            shared.reconnect_timer = None;
            shared.server.clone()
        };
        if let Some(server) = server {
            self.start_attempt(server);
        }
    }

    fn spawn_keepalive(&self, outbound: mpsc::UnboundedSender<Message>, cancel: CancellationToken) {
        let interval = self.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let ping = match OutboundFrame::new(protocol::PING).to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("failed to encode keepalive ping: {}", e);
                                continue;
                            }
                        };
                        if outbound.send(Message::Text(ping.into())).is_err() {
                            warn!("keepalive ping failed: socket writer closed");
                        }
                    }
                }
            }
        });
    }

    fn write(&self, frame: &OutboundFrame) -> Result<(), RequestError> {
        let json = frame
            .to_json()
            .map_err(|e| RequestError::Transport(e.to_string()))?;
        let shared = lock(&self.shared);
        let socket = shared.socket.as_ref().ok_or(RequestError::NotConnected)?;
        socket
            .outbound
            .send(Message::Text(json.into()))
            .map_err(|_| RequestError::Transport("socket writer closed".to_string()))
    }

    /// Register a pending request, write it, and wait for the matching
    /// response, the deadline, or connection loss.
    async fn request(
        &self,
        request_type: &str,
        payload: Option<Value>,
        timeout: Duration,
        encode: bool,
    ) -> Result<InboundFrame, RequestError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let payload = match payload {
            Some(p) if encode => Some(self.codec.encode(p).map_err(RequestError::Codec)?),
            other => other,
        };
        let frame = OutboundFrame {
            payload,
            request_id: Some(request_id.clone()),
            ..OutboundFrame::new(request_type)
        };
        let json = frame
            .to_json()
            .map_err(|e| RequestError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            let socket = shared.socket.as_ref().ok_or(RequestError::NotConnected)?;
            if socket.outbound.send(Message::Text(json.into())).is_err() {
                return Err(RequestError::Transport("socket writer closed".to_string()));
            }
            shared.pending.insert(
                request_id.clone(),
                PendingRequest {
                    request_type: request_type.to_string(),
                    deadline: Instant::now() + timeout,
                    tx,
                },
            );
        }
        trace!(request_id = %request_id, request_type = %request_type, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                lock(&self.shared).pending.remove(&request_id);
                debug!(request_id = %request_id, request_type = %request_type, "request timed out");
                Err(RequestError::Timeout {
                    request_type: request_type.to_string(),
                    timeout,
                })
            }
        }
    }

    fn settle_auth(self: &Arc<Self>, generation: u64, response: &InboundFrame) {
        if response.success {
            self.authenticated(generation);
        } else {
            let reason = response.error.as_deref().unwrap_or("unknown error");
            self.auth_failed(generation, format!("Authentication failed: {reason}"));
        }
    }

    fn handle_text(self: &Arc<Self>, generation: u64, text: &str) {
        let mut frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
                return;
            }
        };

        let mut codec_error = None;
        if frame.kind != protocol::AUTHENTICATE {
            if let Some(payload) = frame.payload.take() {
                match self.codec.decode(payload) {
                    Ok(decoded) => frame.payload = Some(decoded),
                    Err(e) => codec_error = Some(e),
                }
            }
        }

        if let Some(request_id) = frame.request_id.as_deref() {
            let pending = lock(&self.shared).pending.remove(request_id);
            if let Some(pending) = pending {
                // Applied here, in socket order, so a close right after a
                // rejection cannot race the handshake result.
                if pending.request_type == protocol::AUTHENTICATE {
                    self.settle_auth(generation, &frame);
                }
                let result = match codec_error {
                    Some(e) => Err(RequestError::Codec(e)),
                    None => Ok(frame),
                };
                let _ = pending.tx.send(result);
                return;
            }
        }

        if let Some(e) = codec_error {
            warn!(kind = %frame.kind, "dropping undecodable broadcast: {}", e);
            return;
        }

        self.message_subs.notify(&frame);
    }
}

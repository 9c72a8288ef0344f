//! In-process mock daemon for integration tests.
//!
//! Speaks the daemon side of the wire protocol over a loopback WebSocket:
//! token authentication, a per-session transcript behind `get_highlights`,
//! `get_status`, `send_input`, and knobs to stall, delay or fail requests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use companion_core::{ConnectionConfig, ConnectionStatus, Highlight, Role, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Behavior {
    /// Request types that never get a response.
    ignore: HashSet<String>,
    /// Request types answered after a delay.
    delay: HashMap<String, Duration>,
    /// Per-session delay applied to `get_highlights`.
    session_delay: HashMap<String, Duration>,
    fail_send_input: bool,
}

struct Client {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

struct DaemonState {
    token: String,
    behavior: Mutex<Behavior>,
    transcripts: Mutex<HashMap<String, Vec<Highlight>>>,
    received: Mutex<Vec<Value>>,
    clients: Mutex<Vec<Client>>,
    accepted: AtomicUsize,
    next_id: AtomicUsize,
}

pub struct MockDaemon {
    pub addr: SocketAddr,
    state: Arc<DaemonState>,
    shutdown: CancellationToken,
}

impl MockDaemon {
    pub async fn start(token: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(DaemonState {
            token: token.to_string(),
            behavior: Mutex::new(Behavior::default()),
            transcripts: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        });
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            if let Ok(ws) = accept_async(stream).await {
                                state.accepted.fetch_add(1, Ordering::SeqCst);
                                serve(state, ws).await;
                            }
                        });
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn server(&self, id: &str) -> ServerConfig {
        ServerConfig::new(id, "127.0.0.1", self.addr.port(), self.state.token.clone())
    }

    pub fn server_with_token(&self, id: &str, token: &str) -> ServerConfig {
        ServerConfig::new(id, "127.0.0.1", self.addr.port(), token)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self, kind: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame["type"] == kind)
            .cloned()
            .collect()
    }

    pub fn ignore(&self, kind: &str) {
        self.state.behavior.lock().unwrap().ignore.insert(kind.to_string());
    }

    pub fn answer(&self, kind: &str) {
        self.state.behavior.lock().unwrap().ignore.remove(kind);
    }

    pub fn delay(&self, kind: &str, delay: Duration) {
        self.state
            .behavior
            .lock()
            .unwrap()
            .delay
            .insert(kind.to_string(), delay);
    }

    pub fn delay_session(&self, session_id: &str, delay: Duration) {
        self.state
            .behavior
            .lock()
            .unwrap()
            .session_delay
            .insert(session_id.to_string(), delay);
    }

    pub fn fail_send_input(&self, fail: bool) {
        self.state.behavior.lock().unwrap().fail_send_input = fail;
    }

    pub fn set_transcript(&self, session_id: &str, highlights: Vec<Highlight>) {
        self.state
            .transcripts
            .lock()
            .unwrap()
            .insert(session_id.to_string(), highlights);
    }

    pub fn transcript(&self, session_id: &str) -> Vec<Highlight> {
        self.state
            .transcripts
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Send a broadcast frame to every connected client.
    pub fn push(&self, frame: Value) {
        let text = frame.to_string();
        for client in self.state.clients.lock().unwrap().iter() {
            let _ = client.outbound.send(Message::Text(text.clone().into()));
        }
    }

    /// Close every client socket from the daemon side.
    pub fn drop_all(&self) {
        for client in self.state.clients.lock().unwrap().drain(..) {
            client.cancel.cancel();
        }
    }

    /// Stop accepting and close every client.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.drop_all();
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(state: Arc<DaemonState>, ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) {
    let (mut write, mut read) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let cancel = CancellationToken::new();
    state.clients.lock().unwrap().push(Client {
        outbound: outbound.clone(),
        cancel: cancel.clone(),
    });

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                    state.received.lock().unwrap().push(frame.clone());
                    respond(&state, frame, &outbound);
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
    cancel.cancel();
}

fn respond(state: &Arc<DaemonState>, frame: Value, outbound: &mpsc::UnboundedSender<Message>) {
    let kind = frame["type"].as_str().unwrap_or_default().to_string();
    let Some(request_id) = frame["requestId"].as_str().map(str::to_string) else {
        return;
    };
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);

    let (ignored, mut delay, fail_send_input) = {
        let behavior = state.behavior.lock().unwrap();
        (
            behavior.ignore.contains(&kind),
            behavior.delay.get(&kind).copied(),
            behavior.fail_send_input,
        )
    };
    if ignored {
        return;
    }

    let reply = match kind.as_str() {
        "authenticate" => {
            if payload["token"] == state.token.as_str() {
                json!({"type": "authenticate", "success": true, "requestId": request_id})
            } else {
                json!({"type": "authenticate", "success": false, "error": "Invalid token", "requestId": request_id})
            }
        }
        "ping" => json!({"type": "ping", "success": true, "requestId": request_id}),
        "get_highlights" => {
            let session_id = payload["sessionId"].as_str().unwrap_or_default();
            if let Some(d) = state.behavior.lock().unwrap().session_delay.get(session_id) {
                delay = Some(*d);
            }
            let limit = payload["limit"].as_u64().unwrap_or(50) as usize;
            let offset = payload["offset"].as_u64().unwrap_or(0) as usize;
            let all = state
                .transcripts
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or_default();
            let end = all.len().saturating_sub(offset);
            let start = end.saturating_sub(limit);
            json!({
                "type": "get_highlights",
                "success": true,
                "requestId": request_id,
                "payload": {
                    "highlights": &all[start..end],
                    "total": all.len(),
                    "hasMore": start > 0,
                }
            })
        }
        "get_status" => json!({
            "type": "get_status",
            "success": true,
            "requestId": request_id,
            "payload": {"isRunning": true, "isWaitingForInput": true},
        }),
        "send_input" => {
            if fail_send_input {
                json!({"type": "send_input", "success": false, "error": "session busy", "requestId": request_id})
            } else {
                let session_id = payload["sessionId"].as_str().unwrap_or("default").to_string();
                let n = state.next_id.fetch_add(1, Ordering::SeqCst);
                let entry = Highlight::new(
                    format!("msg-{n}"),
                    Role::User,
                    payload["input"].as_str().unwrap_or_default(),
                    chrono::Utc::now().timestamp_millis(),
                );
                state
                    .transcripts
                    .lock()
                    .unwrap()
                    .entry(session_id)
                    .or_default()
                    .push(entry);
                json!({"type": "send_input", "success": true, "requestId": request_id})
            }
        }
        other => json!({"type": other, "success": true, "requestId": request_id}),
    };

    let text = reply.to_string();
    match delay {
        Some(delay) => {
            let outbound = outbound.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = outbound.send(Message::Text(text.into()));
            });
        }
        None => {
            let _ = outbound.send(Message::Text(text.into()));
        }
    }
}

/// Timings scaled down so state machine tests finish quickly.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        settle_delay: Duration::from_millis(5),
        connect_timeout: Duration::from_secs(2),
        auth_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        health_timeout: Duration::from_millis(300),
        keepalive_interval: Duration::from_secs(30),
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        max_reconnect_attempts: None,
        probe_on_health_check: false,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(
    connection: &companion_core::Connection,
    status: ConnectionStatus,
) -> bool {
    eventually(Duration::from_secs(5), || connection.state().status == status).await
}

pub fn user(id: &str, content: &str, ts: i64) -> Highlight {
    Highlight::new(id, Role::User, content, ts)
}

pub fn assistant(id: &str, content: &str, ts: i64) -> Highlight {
    Highlight::new(id, Role::Assistant, content, ts)
}

//! Durable per-server FIFO of messages typed while the session was
//! unreachable.
//!
//! Messages are persisted through a [`KeyValueStore`] on every mutation and
//! drained by [`Connection`] after each successful authentication.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{RequestError, StoreError};
use crate::protocol::{self, SendInput};
use crate::pubsub::{Subscribers, Subscription, lock};
use crate::store::KeyValueStore;

/// Store key holding the queue as a JSON array.
pub const QUEUE_KEY: &str = "message_queue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub queued_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The set of queued messages for a server changed.
    Changed { server_id: String },
    Delivered { message: QueuedMessage },
    DeliveryFailed {
        message: QueuedMessage,
        error: RequestError,
    },
    /// A drain finished (completed, stopped on failure, or stopped because
    /// the connection dropped).
    Flushed {
        server_id: String,
        delivered: usize,
        remaining: usize,
    },
}

impl QueueEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::Changed { server_id } | Self::Flushed { server_id, .. } => server_id,
            Self::Delivered { message } | Self::DeliveryFailed { message, .. } => {
                &message.server_id
            }
        }
    }
}

struct QueueInner {
    store: Arc<dyn KeyValueStore>,
    messages: Mutex<Vec<QueuedMessage>>,
    draining: Mutex<HashSet<String>>,
    subscribers: Subscribers<QueueEvent>,
}

#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("messages", &lock(&self.inner.messages).len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStop {
    Empty,
    NotReady,
    Failed,
}

/// Clears the per-server drain flag when a drain exits by any path.
struct DrainSlot<'a> {
    draining: &'a Mutex<HashSet<String>>,
    server_id: String,
}

impl Drop for DrainSlot<'_> {
    fn drop(&mut self) {
        lock(self.draining).remove(&self.server_id);
    }
}

impl MessageQueue {
    /// Empty queue backed by `store`. Existing persisted messages are
    /// ignored; use [`MessageQueue::load`] to restore them.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_messages(store, Vec::new())
    }

    /// Restore the queue persisted in `store`. A corrupt entry is logged and
    /// replaced with an empty queue.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let messages = match store.get(QUEUE_KEY)? {
            Some(raw) => match serde_json::from_str::<Vec<QueuedMessage>>(&raw) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Discarding unreadable message queue: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if !messages.is_empty() {
            info!("Restored {} queued message(s)", messages.len());
        }
        Ok(Self::with_messages(store, messages))
    }

    fn with_messages(store: Arc<dyn KeyValueStore>, messages: Vec<QueuedMessage>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                messages: Mutex::new(messages),
                draining: Mutex::new(HashSet::new()),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&QueueEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.subscribers.subscribe(handler)
    }

    pub fn enqueue(&self, server_id: &str, text: &str) -> Result<QueuedMessage, StoreError> {
        self.push(server_id, None, text)
    }

    pub fn enqueue_for_session(
        &self,
        server_id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<QueuedMessage, StoreError> {
        self.push(server_id, Some(session_id), text)
    }

    fn push(
        &self,
        server_id: &str,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<QueuedMessage, StoreError> {
        let message = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            session_id: session_id.map(str::to_string),
            text: text.to_string(),
            queued_at: chrono::Utc::now().timestamp_millis(),
        };
        self.mutate(|messages| messages.push(message.clone()))?;
        debug!(server = %server_id, id = %message.id, "message queued");
        self.notify_changed(server_id);
        Ok(message)
    }

    /// Remove one message. Returns whether it was queued.
    pub fn cancel(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.mutate(|messages| {
            let index = messages.iter().position(|m| m.id == id)?;
            Some(messages.remove(index))
        })?;
        match removed {
            Some(message) => {
                self.notify_changed(&message.server_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every message queued for `server_id`. Returns how many were
    /// removed.
    pub fn clear_all(&self, server_id: &str) -> Result<usize, StoreError> {
        let removed = self.mutate(|messages| {
            let before = messages.len();
            messages.retain(|m| m.server_id != server_id);
            before - messages.len()
        })?;
        if removed > 0 {
            self.notify_changed(server_id);
        }
        Ok(removed)
    }

    /// Replace a queued message's text, keeping its place in line.
    pub fn edit(&self, id: &str, text: &str) -> Result<bool, StoreError> {
        let edited = self.mutate(|messages| {
            let message = messages.iter_mut().find(|m| m.id == id)?;
            message.text = text.to_string();
            Some(message.server_id.clone())
        })?;
        match edited {
            Some(server_id) => {
                self.notify_changed(&server_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn messages(&self) -> Vec<QueuedMessage> {
        lock(&self.inner.messages).clone()
    }

    /// Messages for one server in delivery order.
    pub fn messages_for(&self, server_id: &str) -> Vec<QueuedMessage> {
        lock(&self.inner.messages)
            .iter()
            .filter(|m| m.server_id == server_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self, server_id: &str) -> bool {
        lock(&self.inner.draining).contains(server_id)
    }

    /// Deliver the connection's server's queued messages, oldest first.
    ///
    /// At most one drain runs per server; a concurrent call returns 0
    /// immediately. The drain stops when the connection drops or a delivery
    /// fails, leaving the rest queued. Returns the number delivered.
    pub async fn drain(&self, connection: &Connection) -> usize {
        let Some(server) = connection.server() else {
            return 0;
        };
        let server_id = server.id;

        let Some(mut slot) = self.claim(&server_id) else {
            debug!(server = %server_id, "drain already running");
            return 0;
        };

        let mut delivered = 0;
        loop {
            let stop = self.deliver_queued(connection, &server_id, &mut delivered).await;
            drop(slot);
            // A message queued between the last read and the release above
            // saw a running drain and did not start one.
            if stop != DrainStop::Empty || self.messages_for(&server_id).is_empty() {
                break;
            }
            match self.claim(&server_id) {
                Some(next) => slot = next,
                None => break,
            }
        }

        let remaining = self.messages_for(&server_id).len();
        if delivered > 0 || remaining > 0 {
            info!(server = %server_id, delivered, remaining, "queue drain finished");
        }
        self.inner.subscribers.notify(&QueueEvent::Flushed {
            server_id,
            delivered,
            remaining,
        });
        delivered
    }

    fn claim(&self, server_id: &str) -> Option<DrainSlot<'_>> {
        if !lock(&self.inner.draining).insert(server_id.to_string()) {
            return None;
        }
        Some(DrainSlot {
            draining: &self.inner.draining,
            server_id: server_id.to_string(),
        })
    }

    async fn deliver_queued(
        &self,
        connection: &Connection,
        server_id: &str,
        delivered: &mut usize,
    ) -> DrainStop {
        loop {
            if !connection.is_connected() {
                debug!(server = %server_id, "connection not ready, pausing drain");
                return DrainStop::NotReady;
            }
            let Some(next) = self.messages_for(server_id).into_iter().next() else {
                return DrainStop::Empty;
            };

            match deliver(connection, &next).await {
                Ok(()) => {
                    if let Err(e) = self.remove_delivered(&next.id) {
                        warn!(server = %server_id, id = %next.id, "Failed to persist queue: {}", e);
                    }
                    *delivered += 1;
                    self.inner
                        .subscribers
                        .notify(&QueueEvent::Delivered { message: next });
                    self.notify_changed(server_id);
                }
                Err(error) => {
                    warn!(server = %server_id, id = %next.id, "Queued message delivery failed: {}", error);
                    self.inner
                        .subscribers
                        .notify(&QueueEvent::DeliveryFailed {
                            message: next,
                            error,
                        });
                    return DrainStop::Failed;
                }
            }
        }
    }

    fn remove_delivered(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|messages| messages.retain(|m| m.id != id))
    }

    /// Apply `f` to a copy, persist the copy, then commit it. A failed write
    /// leaves the in-memory queue untouched.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<QueuedMessage>) -> R) -> Result<R, StoreError> {
        let mut messages = lock(&self.inner.messages);
        let mut next = messages.clone();
        let result = f(&mut next);
        if next != *messages {
            let raw = serde_json::to_string(&next)?;
            self.inner.store.set(QUEUE_KEY, &raw)?;
            *messages = next;
        }
        Ok(result)
    }

    fn notify_changed(&self, server_id: &str) {
        self.inner.subscribers.notify(&QueueEvent::Changed {
            server_id: server_id.to_string(),
        });
    }
}

async fn deliver(connection: &Connection, message: &QueuedMessage) -> Result<(), RequestError> {
    let payload = serde_json::to_value(SendInput {
        input: &message.text,
        session_id: message.session_id.as_deref(),
        client_message_id: &message.id,
    })
    .map_err(|e| RequestError::Codec(e.to_string()))?;

    connection
        .send_request(protocol::SEND_INPUT, Some(payload), None)
        .await?
        .into_result()?;
    Ok(())
}

//! Conversation synchronizer: keeps one session's transcript and status
//! current while the user moves between sessions and servers.
//!
//! Every response is checked against the [`SessionGuard`] epoch captured
//! before its request was issued; a response whose epoch is no longer
//! current is dropped without touching the view. Locally sent input shows up
//! at once as an optimistic entry and is reconciled against the next fetched
//! page by [`merge_optimistic`].

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::connection::Connection;
use crate::error::{RequestError, SyncError};
use crate::manager::ConnectionManager;
use crate::protocol::{
    self, GetHighlights, GetStatus, Highlight, HighlightsPage, OPTIMISTIC_PREFIX, Role,
    SendInput, ServerEvent, SessionStatus, SwitchSession,
};
use crate::pubsub::{Subscribers, Subscription, lock};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::session::{CachedSession, Epoch, SessionCache, SessionGuard};

/// What the rendering layer sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub server_id: Option<String>,
    pub session_id: Option<String>,
    pub highlights: Vec<Highlight>,
    pub status: Option<SessionStatus>,
    /// Server-side transcript length.
    pub total: usize,
    pub has_more: bool,
    pub loading: bool,
    pub error: Option<String>,
    /// Highlights come from the cache and no fetch has landed yet.
    pub from_cache: bool,
}

impl ConversationView {
    /// Entries that came from the daemon (excludes optimistic echoes).
    pub fn confirmed_len(&self) -> usize {
        self.highlights.iter().filter(|h| !h.is_optimistic()).count()
    }

    pub fn pending_len(&self) -> usize {
        self.highlights.iter().filter(|h| h.is_optimistic()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Updated,
    Unchanged,
    /// The session was switched while the fetch was in flight; the result
    /// was dropped.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(Highlight),
    Queued(QueuedMessage),
}

/// Reconcile optimistic entries from `current` with a freshly fetched page.
///
/// An optimistic entry whose content equals a user entry in `fetched` is
/// confirmed and dropped. The rest are inserted after the last fetched entry
/// whose timestamp is not later than theirs. Applying the merge again with
/// the same page yields the same list.
pub fn merge_optimistic(current: &[Highlight], fetched: &[Highlight]) -> Vec<Highlight> {
    let mut merged: Vec<Highlight> = fetched.iter().filter(|h| !h.is_optimistic()).cloned().collect();

    let mut unconfirmed: Vec<&Highlight> = current
        .iter()
        .filter(|h| h.is_optimistic())
        .filter(|local| {
            !merged
                .iter()
                .any(|h| h.role == Role::User && h.content == local.content)
        })
        .collect();
    unconfirmed.sort_by_key(|h| h.timestamp);

    for local in unconfirmed {
        let at = merged
            .iter()
            .rposition(|h| h.timestamp <= local.timestamp)
            .map_or(0, |i| i + 1);
        merged.insert(at, local.clone());
    }
    merged
}

/// Cheap structural equality: same id sequence and identical trailing entry.
/// The trailing entry is the only one whose content or tool status changes
/// while an agent is working.
pub fn same_transcript(a: &[Highlight], b: &[Highlight]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id) && a.last() == b.last()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    server_id: String,
    session_id: String,
    epoch: Epoch,
}

/// Poll loop and push-event subscription for the current session.
struct Background {
    cancel: CancellationToken,
    _events: Subscription,
}

impl Drop for Background {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SyncInner {
    manager: ConnectionManager,
    guard: SessionGuard,
    cache: SessionCache,
    queue: Option<MessageQueue>,
    config: SyncConfig,
    target: Mutex<Option<Target>>,
    view: Mutex<ConversationView>,
    background: Mutex<Option<Background>>,
    subscribers: Subscribers<ConversationView>,
}

#[derive(Clone)]
pub struct ConversationSync {
    inner: Arc<SyncInner>,
}

impl std::fmt::Debug for ConversationSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSync")
            .field("target", &*lock(&self.inner.target))
            .finish()
    }
}

impl ConversationSync {
    pub fn new(
        manager: ConnectionManager,
        guard: SessionGuard,
        cache: SessionCache,
        queue: Option<MessageQueue>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                manager,
                guard,
                cache,
                queue,
                config,
                target: Mutex::new(None),
                view: Mutex::new(ConversationView::default()),
                background: Mutex::new(None),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn view(&self) -> ConversationView {
        lock(&self.inner.view).clone()
    }

    /// Subscribe to view changes. The current view is delivered immediately.
    pub fn subscribe(
        &self,
        handler: impl Fn(&ConversationView) + Send + Sync + 'static,
    ) -> Subscription {
        let current = self.view();
        self.inner.subscribers.subscribe_with_replay(&current, handler)
    }

    /// Current epoch of the entered session.
    pub fn epoch(&self) -> Option<Epoch> {
        lock(&self.inner.target).as_ref().map(|t| t.epoch)
    }

    /// Switch to `session_id` on `server_id`.
    ///
    /// The epoch is taken before anything else, so responses for the
    /// previous session become inert immediately. A fresh cache entry is
    /// shown while the first fetch is in flight. Polling and push-event
    /// handling run until the next switch or [`leave`](Self::leave).
    pub async fn enter_session(
        &self,
        server_id: &str,
        session_id: &str,
    ) -> Result<PollOutcome, SyncError> {
        let target = {
            let mut current = lock(&self.inner.target);
            if let Some(previous) = current.take() {
                self.inner
                    .guard
                    .invalidate(&previous.server_id, &previous.session_id);
            }
            let target = Target {
                server_id: server_id.to_string(),
                session_id: session_id.to_string(),
                epoch: self.inner.guard.begin_switch(server_id, session_id),
            };
            *current = Some(target.clone());
            target
        };
        self.stop_background();

        let cached = self.inner.cache.get(server_id, session_id);
        let view = ConversationView {
            server_id: Some(server_id.to_string()),
            session_id: Some(session_id.to_string()),
            loading: true,
            from_cache: cached.is_some(),
            ..cached
                .map(|c| ConversationView {
                    highlights: c.highlights,
                    status: c.status,
                    total: c.total,
                    has_more: c.has_more,
                    ..Default::default()
                })
                .unwrap_or_default()
        };
        self.inner.publish(view);

        if let Some(connection) = self.inner.connection(&target).ok().filter(Connection::is_connected) {
            let payload = serde_json::to_value(SwitchSession {
                session_id,
                epoch: target.epoch.value(),
            })
            .map_err(|e| RequestError::Codec(e.to_string()))?;
            if let Err(e) = connection.send(protocol::SWITCH_SESSION, Some(payload)) {
                debug!(server = %server_id, "switch_session not sent: {}", e);
            }
        }

        let outcome = self.inner.fetch(&target, true).await;
        if self.inner.is_current(&target) {
            self.start_background(target);
        }
        outcome
    }

    /// Stop polling and forget the current session.
    pub fn leave(&self) {
        self.stop_background();
        if let Some(previous) = lock(&self.inner.target).take() {
            self.inner
                .guard
                .invalidate(&previous.server_id, &previous.session_id);
        }
        self.inner.publish(ConversationView::default());
    }

    /// Fetch the current session now, surfacing failures in the view.
    pub async fn refresh(&self) -> Result<PollOutcome, SyncError> {
        let target = self.inner.target()?;
        self.inner.fetch(&target, true).await
    }

    /// Send input to the current session and echo it optimistically.
    pub async fn send_input(&self, text: &str) -> Result<Highlight, SyncError> {
        let target = self.inner.target()?;
        let connection = self.inner.connection(&target)?;
        let client_message_id = uuid::Uuid::new_v4().to_string();

        let payload = serde_json::to_value(SendInput {
            input: text,
            session_id: Some(&target.session_id),
            client_message_id: &client_message_id,
        })
        .map_err(|e| RequestError::Codec(e.to_string()))?;
        connection
            .send_request(protocol::SEND_INPUT, Some(payload), None)
            .await?
            .into_result()?;

        let echo = Highlight::new(
            format!("{OPTIMISTIC_PREFIX}{client_message_id}"),
            Role::User,
            text,
            chrono::Utc::now().timestamp_millis(),
        );

        let mut view = lock(&self.inner.view);
        if !self.inner.is_current(&target) {
            trace!(session = %target.session_id, "input sent for a session no longer shown");
            return Ok(echo);
        }
        let mut next = view.clone();
        next.highlights.push(echo.clone());
        *view = next.clone();
        drop(view);
        self.inner.subscribers.notify(&next);
        Ok(echo)
    }

    /// Send when the owning connection is ready, otherwise queue for
    /// delivery on the next successful authentication. A send that fails for
    /// a retryable reason is queued too. While older messages for the server
    /// are still queued, new text joins the back of the queue so it never
    /// overtakes them.
    pub async fn send_or_enqueue(&self, text: &str) -> Result<SendOutcome, SyncError> {
        let target = self.inner.target()?;
        let connection = self.inner.connection(&target).ok();
        let ready = connection.as_ref().is_some_and(Connection::is_connected);
        let backlog = self.inner.queue.as_ref().is_some_and(|q| {
            q.is_draining(&target.server_id) || !q.messages_for(&target.server_id).is_empty()
        });

        if ready && !backlog {
            match self.send_input(text).await {
                Ok(echo) => return Ok(SendOutcome::Sent(echo)),
                Err(SyncError::Request(e)) if e.is_retryable() && self.inner.queue.is_some() => {
                    debug!(server = %target.server_id, "send failed ({}), queueing", e);
                }
                Err(e) => return Err(e),
            }
        }

        let queue = self
            .inner
            .queue
            .as_ref()
            .ok_or_else(|| SyncError::NoConnection(target.server_id.clone()))?;
        let message = queue.enqueue_for_session(&target.server_id, &target.session_id, text)?;

        if let Some(connection) = connection.filter(|_| ready && backlog) {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.drain(&connection).await;
            });
        }
        Ok(SendOutcome::Queued(message))
    }

    /// Fetch the page older than what is loaded and prepend it. Returns the
    /// number of entries added.
    pub async fn load_more(&self) -> Result<usize, SyncError> {
        let target = self.inner.target()?;
        let connection = self.inner.connection(&target)?;
        let offset = lock(&self.inner.view).confirmed_len();

        let payload = serde_json::to_value(GetHighlights {
            session_id: &target.session_id,
            limit: self.inner.config.page_size,
            offset: Some(offset),
        })
        .map_err(|e| RequestError::Codec(e.to_string()))?;
        let page: HighlightsPage = connection
            .send_request(protocol::GET_HIGHLIGHTS, Some(payload), None)
            .await?
            .decode_payload()?;

        let mut view = lock(&self.inner.view);
        if !self.inner.is_current(&target) {
            trace!(session = %target.session_id, "discarding stale page");
            return Ok(0);
        }
        let added = page.highlights.len();
        let mut next = view.clone();
        next.highlights.splice(0..0, page.highlights);
        next.total = page.total;
        next.has_more = page.has_more;
        *view = next.clone();
        drop(view);
        self.inner.subscribers.notify(&next);
        Ok(added)
    }

    fn stop_background(&self) {
        let background = lock(&self.inner.background).take();
        drop(background);
    }

    fn start_background(&self, target: Target) {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let event_target = target.clone();
        let event_wake = wake.clone();
        let events = self.inner.manager.on_message(move |server_id, frame| {
            if server_id != event_target.server_id {
                return;
            }
            let event = ServerEvent::from_frame(frame.clone());
            if !event.concerns(&event_target.session_id) {
                return;
            }
            match event {
                ServerEvent::StatusChange {
                    status: Some(status),
                    ..
                } => {
                    if let Some(inner) = weak.upgrade() {
                        inner.apply_status(&event_target, status);
                    }
                    event_wake.notify_one();
                }
                ServerEvent::StatusChange { .. } | ServerEvent::ConversationUpdate { .. } => {
                    event_wake.notify_one();
                }
                ServerEvent::Unknown(_) => {}
            }
        });

        let inner = self.inner.clone();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if !inner.is_current(&target) {
                    break;
                }
                if let Err(e) = inner.fetch(&target, false).await {
                    debug!(session = %target.session_id, "poll failed: {}", e);
                }
            }
            trace!(session = %target.session_id, "poll loop stopped");
        });

        let previous = lock(&self.inner.background).replace(Background {
            cancel,
            _events: events,
        });
        drop(previous);
    }
}

impl SyncInner {
    fn target(&self) -> Result<Target, SyncError> {
        lock(&self.target).clone().ok_or(SyncError::NoSession)
    }

    fn is_current(&self, target: &Target) -> bool {
        lock(&self.target).as_ref() == Some(target)
            && self
                .guard
                .is_valid(&target.server_id, &target.session_id, target.epoch)
    }

    fn connection(&self, target: &Target) -> Result<Connection, SyncError> {
        self.manager
            .get_connection(&target.server_id)
            .ok_or_else(|| SyncError::NoConnection(target.server_id.clone()))
    }

    fn publish(&self, view: ConversationView) {
        *lock(&self.view) = view.clone();
        self.subscribers.notify(&view);
    }

    /// Combined page + status fetch under `target`'s epoch.
    ///
    /// The page is sized to cover everything already loaded so polling
    /// never truncates pages pulled in by `load_more`. A failed status
    /// request keeps the previous status.
    async fn fetch(&self, target: &Target, surface_errors: bool) -> Result<PollOutcome, SyncError> {
        let result = self.fetch_page_and_status(target).await;

        let mut view = lock(&self.view);
        if !self.is_current(target) {
            trace!(
                server = %target.server_id,
                session = %target.session_id,
                epoch = %target.epoch,
                "discarding stale response"
            );
            return Ok(PollOutcome::Stale);
        }

        let (page, status) = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                if surface_errors {
                    let mut next = view.clone();
                    next.loading = false;
                    next.error = Some(e.to_string());
                    if next != *view {
                        *view = next.clone();
                        drop(view);
                        self.subscribers.notify(&next);
                    }
                }
                return Err(e);
            }
        };

        let merged = merge_optimistic(&view.highlights, &page.highlights);
        let status = status.or_else(|| view.status.clone());

        let unchanged = same_transcript(&view.highlights, &merged)
            && view.status == status
            && view.total == page.total
            && view.has_more == page.has_more;

        let mut next = view.clone();
        next.loading = false;
        next.error = None;
        next.from_cache = false;
        if !unchanged {
            next.highlights = merged;
            next.status = status;
            next.total = page.total;
            next.has_more = page.has_more;
        }

        self.cache.put(
            &target.server_id,
            &target.session_id,
            CachedSession {
                highlights: next.highlights.clone(),
                status: next.status.clone(),
                total: next.total,
                has_more: next.has_more,
            },
        );

        if next == *view {
            return Ok(PollOutcome::Unchanged);
        }
        *view = next.clone();
        drop(view);
        self.subscribers.notify(&next);

        Ok(if unchanged {
            PollOutcome::Unchanged
        } else {
            PollOutcome::Updated
        })
    }

    async fn fetch_page_and_status(
        &self,
        target: &Target,
    ) -> Result<(HighlightsPage, Option<SessionStatus>), SyncError> {
        let connection = self.connection(target)?;
        let limit = self
            .config
            .page_size
            .max(lock(&self.view).confirmed_len());

        let page_payload = to_payload(GetHighlights {
            session_id: &target.session_id,
            limit,
            offset: None,
        })?;
        let status_payload = to_payload(GetStatus {
            session_id: &target.session_id,
        })?;

        let (page, status) = tokio::join!(
            connection.send_request(protocol::GET_HIGHLIGHTS, Some(page_payload), None),
            connection.send_request(protocol::GET_STATUS, Some(status_payload), None),
        );

        let page: HighlightsPage = page?.decode_payload()?;
        let status = match status.and_then(|frame| frame.decode_payload::<SessionStatus>()) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(session = %target.session_id, "status fetch failed: {}", e);
                None
            }
        };
        Ok((page, status))
    }

    fn apply_status(&self, target: &Target, status: SessionStatus) {
        let mut view = lock(&self.view);
        if !self.is_current(target) || view.status.as_ref() == Some(&status) {
            return;
        }
        let mut next = view.clone();
        next.status = Some(status);
        *view = next.clone();
        drop(view);
        self.subscribers.notify(&next);
    }
}

fn to_payload(value: impl serde::Serialize) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|e| RequestError::Codec(e.to_string()).into())
}

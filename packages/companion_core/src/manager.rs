//! Pool of per-server connections.
//!
//! The manager owns one [`Connection`] per enabled server, reconciles the
//! pool against the configured server list, and fans every connection's
//! events out to pool-level subscribers tagged with the server id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tracing::{debug, info};

use crate::codec::{PayloadCodec, PlainCodec};
use crate::config::{ConnectionConfig, ServerConfig};
use crate::connection::{Connection, ConnectionState};
use crate::protocol::InboundFrame;
use crate::pubsub::{Subscribers, Subscription, lock};
use crate::queue::MessageQueue;

struct PooledConnection {
    server: ServerConfig,
    connection: Connection,
    state_sub: Subscription,
    message_sub: Subscription,
}

impl PooledConnection {
    /// Disconnect, then unregister the forwarded subscriptions.
    fn teardown(self) {
        self.connection.disconnect();
        self.state_sub.unsubscribe();
        self.message_sub.unsubscribe();
    }
}

struct ManagerInner {
    config: ConnectionConfig,
    codec: Arc<dyn PayloadCodec>,
    queue: Option<MessageQueue>,
    pool: Mutex<HashMap<String, PooledConnection>>,
    active: Mutex<Option<String>>,
    state_subs: Subscribers<(String, ConnectionState)>,
    message_subs: Subscribers<(String, InboundFrame)>,
}

/// Shared handle to the connection pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("servers", &self.server_ids())
            .field("active", &*lock(&self.inner.active))
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, queue: Option<MessageQueue>) -> Self {
        Self::with_codec(config, Arc::new(PlainCodec), queue)
    }

    pub fn with_codec(
        config: ConnectionConfig,
        codec: Arc<dyn PayloadCodec>,
        queue: Option<MessageQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                codec,
                queue,
                pool: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
                state_subs: Subscribers::new(),
                message_subs: Subscribers::new(),
            }),
        }
    }

    /// Reconcile the pool against `servers`.
    ///
    /// Servers that vanished or were disabled are torn down. Servers whose
    /// endpoint or token changed get a fresh connection. New enabled servers
    /// are created, wired into the fan-out and connected. Unchanged servers
    /// are left alone, so this is safe to call on every settings change.
    pub fn sync_servers(&self, servers: &[ServerConfig]) {
        let wanted: HashMap<&str, &ServerConfig> = servers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id.as_str(), s))
            .collect();

        let mut removed = Vec::new();
        let mut missing = Vec::new();
        {
            let mut pool = lock(&self.inner.pool);

            let stale: Vec<String> = pool
                .iter()
                .filter(|(id, pooled)| {
                    wanted
                        .get(id.as_str())
                        .is_none_or(|server| !server.same_endpoint(&pooled.server))
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(pooled) = pool.remove(&id) {
                    removed.push(pooled);
                }
            }

            for server in wanted.values() {
                match pool.get_mut(&server.id) {
                    Some(pooled) => pooled.server = (*server).clone(),
                    None => missing.push((*server).clone()),
                }
            }
        }

        // Wiring replays the initial state into the fan-out, so it must run
        // without the pool lock held.
        let wired: Vec<PooledConnection> = missing.into_iter().map(|s| self.wire(s)).collect();
        let mut added = Vec::new();
        {
            let mut pool = lock(&self.inner.pool);
            for pooled in wired {
                if pool.contains_key(&pooled.server.id) {
                    removed.push(pooled);
                    continue;
                }
                added.push((pooled.connection.clone(), pooled.server.clone()));
                pool.insert(pooled.server.id.clone(), pooled);
            }
        }

        {
            let mut active = lock(&self.inner.active);
            if active
                .as_deref()
                .is_some_and(|id| !wanted.contains_key(id))
            {
                *active = None;
            }
        }

        for pooled in removed {
            info!(server = %pooled.server.id, "removing connection");
            pooled.teardown();
        }
        for (connection, server) in added {
            info!(server = %server.id, "adding connection");
            connection.connect(server);
        }
    }

    fn wire(&self, server: ServerConfig) -> PooledConnection {
        let connection = Connection::with_parts(
            self.inner.config.clone(),
            self.inner.codec.clone(),
            self.inner.queue.clone(),
        );

        let state_subs = self.inner.state_subs.clone();
        let id = server.id.clone();
        let state_sub = connection
            .on_state_change(move |state| state_subs.notify(&(id.clone(), state.clone())));

        let message_subs = self.inner.message_subs.clone();
        let id = server.id.clone();
        let message_sub =
            connection.on_message(move |frame| message_subs.notify(&(id.clone(), frame.clone())));

        PooledConnection {
            server,
            connection,
            state_sub,
            message_sub,
        }
    }

    pub fn get_connection(&self, server_id: &str) -> Option<Connection> {
        lock(&self.inner.pool)
            .get(server_id)
            .map(|p| p.connection.clone())
    }

    pub fn server(&self, server_id: &str) -> Option<ServerConfig> {
        lock(&self.inner.pool).get(server_id).map(|p| p.server.clone())
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.pool).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The focused connection, if one is set and still pooled.
    pub fn active(&self) -> Option<Connection> {
        let id = lock(&self.inner.active).clone()?;
        self.get_connection(&id)
    }

    pub fn active_id(&self) -> Option<String> {
        lock(&self.inner.active).clone()
    }

    /// Focus `server_id`, or clear focus with `None`. Never disconnects
    /// anything. Returns false (and leaves focus unchanged) for an unknown id.
    pub fn set_active(&self, server_id: Option<&str>) -> bool {
        match server_id {
            Some(id) if !lock(&self.inner.pool).contains_key(id) => {
                debug!(server = %id, "cannot focus unknown server");
                false
            }
            other => {
                *lock(&self.inner.active) = other.map(str::to_string);
                true
            }
        }
    }

    /// Subscribe to state changes of every pooled connection. The current
    /// state of each is delivered immediately.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&str, &ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let handler = Arc::new(handler);
        let forward = handler.clone();
        let subscription = self
            .inner
            .state_subs
            .subscribe(move |(id, state): &(String, ConnectionState)| forward(id, state));

        // Each replay is queued behind that connection's undelivered changes.
        let mut pooled: Vec<(String, Connection)> = lock(&self.inner.pool)
            .iter()
            .map(|(id, p)| (id.clone(), p.connection.clone()))
            .collect();
        pooled.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, connection) in pooled {
            let handler = handler.clone();
            connection.replay_state(Arc::new(move |state: &ConnectionState| handler(&id, state)));
        }
        subscription
    }

    /// Subscribe to uncorrelated frames from every pooled connection.
    pub fn on_message(
        &self,
        handler: impl Fn(&str, &InboundFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .message_subs
            .subscribe(move |(id, frame): &(String, InboundFrame)| handler(id, frame))
    }

    /// Run the health check on every pooled connection (app resume).
    pub async fn check_health_all(&self) {
        let connections: Vec<Connection> = lock(&self.inner.pool)
            .values()
            .map(|p| p.connection.clone())
            .collect();
        join_all(connections.iter().map(Connection::check_health)).await;
    }

    /// Snapshot of every pooled server's state, sorted by server id.
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        let mut states: Vec<(String, ConnectionState)> = lock(&self.inner.pool)
            .iter()
            .map(|(id, p)| (id.clone(), p.connection.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.pool).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect and discard every pooled connection.
    pub fn shutdown(&self) {
        let drained: Vec<PooledConnection> =
            lock(&self.inner.pool).drain().map(|(_, p)| p).collect();
        *lock(&self.inner.active) = None;
        for pooled in drained {
            debug!(server = %pooled.server.id, "shutting down connection");
            pooled.teardown();
        }
    }
}

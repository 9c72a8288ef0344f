//! Session switching guard and per-session transcript cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::protocol::{Highlight, SessionStatus};
use crate::pubsub::lock;

type SessionKey = (String, String);

fn key(server_id: &str, session_id: &str) -> SessionKey {
    (server_id.to_string(), session_id.to_string())
}

/// Token identifying one switch to a session. A response fetched under an
/// epoch may only be applied while that epoch is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing epoch per (server, session).
#[derive(Debug, Clone, Default)]
pub struct SessionGuard {
    epochs: Arc<Mutex<HashMap<SessionKey, u64>>>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a switch: bump and return the epoch. The first switch to a
    /// session yields 1.
    pub fn begin_switch(&self, server_id: &str, session_id: &str) -> Epoch {
        let mut epochs = lock(&self.epochs);
        let epoch = epochs.entry(key(server_id, session_id)).or_insert(0);
        *epoch += 1;
        debug!(server = %server_id, session = %session_id, epoch = *epoch, "session switch");
        Epoch(*epoch)
    }

    pub fn current(&self, server_id: &str, session_id: &str) -> Option<Epoch> {
        lock(&self.epochs)
            .get(&key(server_id, session_id))
            .copied()
            .map(Epoch)
    }

    pub fn is_valid(&self, server_id: &str, session_id: &str, epoch: Epoch) -> bool {
        self.current(server_id, session_id) == Some(epoch)
    }

    /// Make every outstanding epoch for the session stale without starting
    /// a new switch.
    pub fn invalidate(&self, server_id: &str, session_id: &str) {
        if let Some(epoch) = lock(&self.epochs).get_mut(&key(server_id, session_id)) {
            *epoch += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedSession {
    pub highlights: Vec<Highlight>,
    pub status: Option<SessionStatus>,
    pub total: usize,
    pub has_more: bool,
}

struct CacheEntry {
    session: CachedSession,
    stored_at: Instant,
}

/// Last known transcript per (server, session), used to paint instantly on
/// re-entry. Entries older than the TTL are treated as absent.
#[derive(Clone)]
pub struct SessionCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<SessionKey, CacheEntry>>>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("ttl", &self.ttl)
            .field("entries", &lock(&self.entries).len())
            .finish()
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, server_id: &str, session_id: &str) -> Option<CachedSession> {
        let mut entries = lock(&self.entries);
        let k = key(server_id, session_id);
        match entries.get(&k) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.session.clone()),
            Some(_) => {
                entries.remove(&k);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, server_id: &str, session_id: &str, session: CachedSession) {
        lock(&self.entries).insert(
            key(server_id, session_id),
            CacheEntry {
                session,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, server_id: &str, session_id: &str) {
        lock(&self.entries).remove(&key(server_id, session_id));
    }

    /// Drop every session cached for `server_id`.
    pub fn invalidate_server(&self, server_id: &str) {
        lock(&self.entries).retain(|(server, _), _| server != server_id);
    }

    /// Evict expired entries; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

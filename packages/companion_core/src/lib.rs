//! Companion core - realtime connection and session synchronization
//!
//! This crate owns everything between the rendering layer and the remote
//! daemons: one WebSocket per server with handshake, keepalive and
//! reconnection, request/response correlation over that socket, a pool of
//! connections reconciled against the configured server list, a durable
//! outbound message queue, and the epoch guard + optimistic merge that keep
//! the visible transcript consistent while the user hops between sessions.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use companion_core::{
//!     ConnectionConfig, ConnectionManager, ConversationSync, MemoryStore, MessageQueue,
//!     ServerConfig, SessionCache, SessionGuard, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     let queue = MessageQueue::load(store).unwrap();
//!     let manager = ConnectionManager::new(ConnectionConfig::default(), Some(queue.clone()));
//!
//!     manager.sync_servers(&[ServerConfig::new("laptop", "localhost", 9877, "secret")]);
//!
//!     let _states = manager.on_state_change(|server_id, state| {
//!         println!("{server_id}: {}", state.status);
//!     });
//!
//!     let sync = ConversationSync::new(
//!         manager.clone(),
//!         SessionGuard::new(),
//!         SessionCache::default(),
//!         Some(queue),
//!         SyncConfig::default(),
//!     );
//!     if let Err(e) = sync.enter_session("laptop", "main").await {
//!         eprintln!("could not load session: {e}");
//!     }
//!     sync.send_or_enqueue("hello").await.unwrap();
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod pubsub;
pub mod queue;
pub mod session;
pub mod store;

pub use codec::{PayloadCodec, PlainCodec};
pub use config::{
    ClientFileConfig, CompanionDirs, ConnectionConfig, ConnectionFileConfig, Profile,
    ServerConfig, SyncConfig, SyncFileConfig, load_config,
};
pub use connection::{
    Connection, ConnectionState, ConnectionStatus, ConnectionTransition, backoff_delay,
};
pub use conversation::{
    ConversationSync, ConversationView, PollOutcome, SendOutcome, merge_optimistic,
    same_transcript,
};
pub use error::{RequestError, StoreError, SyncError, TransitionError};
pub use manager::ConnectionManager;
pub use protocol::{
    ChoiceOption, Highlight, HighlightsPage, InboundFrame, OPTIMISTIC_PREFIX, OutboundFrame, Role,
    ServerEvent, SessionStatus, ToolCall,
};
pub use pubsub::{Subscribers, Subscription};
pub use queue::{MessageQueue, QUEUE_KEY, QueueEvent, QueuedMessage};
pub use session::{CachedSession, Epoch, SessionCache, SessionGuard};
pub use store::{FileStore, KeyValueStore, MemoryStore};

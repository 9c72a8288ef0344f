//! Error types for requests, persistence, state transitions and synchronization.

use std::time::Duration;

use crate::connection::ConnectionStatus;

/// Why a correlated request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,

    #[error("request '{request_type}' timed out after {timeout:?}")]
    Timeout {
        request_type: String,
        timeout: Duration,
    },

    #[error("connection lost")]
    ConnectionLost,

    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer answered with `success: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("payload codec failure: {0}")]
    Codec(String),

    #[error("malformed response payload: {0}")]
    Decode(String),
}

impl RequestError {
    /// Whether the same request may succeed if re-issued later (after a
    /// reconnect or once the peer catches up).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout { .. } | Self::ConnectionLost | Self::Transport(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {transition} while {from}")]
    InvalidTransition {
        from: ConnectionStatus,
        transition: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("no session selected")]
    NoSession,

    #[error("no connection for server {0}")]
    NoConnection(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("failed to queue message: {0}")]
    Queue(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Queue(e.to_string())
    }
}

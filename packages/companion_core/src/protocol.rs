//! Wire protocol types
//!
//! Every frame on the socket is a JSON text frame. Outbound frames carry a
//! `type`, an optional `payload` and, for correlated requests, a
//! `requestId`. Inbound frames either answer a request (same `requestId`) or
//! are broadcasts initiated by the daemon.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RequestError;

pub const AUTHENTICATE: &str = "authenticate";
pub const PING: &str = "ping";
pub const GET_HIGHLIGHTS: &str = "get_highlights";
pub const GET_STATUS: &str = "get_status";
pub const SEND_INPUT: &str = "send_input";
pub const SWITCH_SESSION: &str = "switch_session";

pub const CONVERSATION_UPDATE: &str = "conversation_update";
pub const STATUS_CHANGE: &str = "status_change";

/// Id prefix of transcript entries synthesized locally before the daemon
/// has confirmed them.
pub const OPTIMISTIC_PREFIX: &str = "optimistic-";

/// Frame sent FROM the client TO the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl OutboundFrame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            request_id: None,
            token: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frame received FROM the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Turn a response frame into its payload, or `Rejected` when the
    /// daemon reported `success: false`.
    pub fn into_result(self) -> Result<Option<Value>, RequestError> {
        if self.success {
            Ok(self.payload)
        } else {
            Err(RequestError::Rejected(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }

    /// Like [`into_result`](Self::into_result), decoding the payload into `T`.
    /// A missing payload decodes as JSON `null`.
    pub fn decode_payload<T: DeserializeOwned>(self) -> Result<T, RequestError> {
        let payload = self.into_result()?.unwrap_or(Value::Null);
        serde_json::from_value(payload).map_err(|e| RequestError::Decode(e.to_string()))
    }

    /// Session the frame is scoped to, from the envelope or the payload.
    pub fn scoped_session_id(&self) -> Option<&str> {
        self.session_id.as_deref().or_else(|| {
            self.payload
                .as_ref()
                .and_then(|p| p.get("sessionId"))
                .and_then(Value::as_str)
        })
    }
}

/// Daemon-initiated broadcast, decoded by `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConversationUpdate {
        session_id: Option<String>,
        payload: Option<Value>,
    },
    StatusChange {
        session_id: Option<String>,
        /// `None` when the payload is absent or not a status object.
        status: Option<SessionStatus>,
    },
    /// Any broadcast type this client does not recognize.
    Unknown(InboundFrame),
}

impl ServerEvent {
    pub fn from_frame(frame: InboundFrame) -> Self {
        let session_id = frame.scoped_session_id().map(str::to_string);
        match frame.kind.as_str() {
            CONVERSATION_UPDATE => Self::ConversationUpdate {
                session_id,
                payload: frame.payload,
            },
            STATUS_CHANGE => {
                let status = frame
                    .payload
                    .as_ref()
                    .map(|p| p.get("status").unwrap_or(p))
                    .and_then(|p| serde_json::from_value(p.clone()).ok());
                Self::StatusChange { session_id, status }
            }
            _ => Self::Unknown(frame),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::ConversationUpdate { session_id, .. } | Self::StatusChange { session_id, .. } => {
                session_id.as_deref()
            }
            Self::Unknown(frame) => frame.scoped_session_id(),
        }
    }

    /// Whether this event applies to `session_id`. Unscoped events apply to
    /// every session.
    pub fn concerns(&self, session_id: &str) -> bool {
        self.session_id().is_none_or(|s| s == session_id)
    }
}

// === Request payloads ===

#[derive(Debug, Clone, Serialize)]
pub struct Authenticate<'a> {
    pub token: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetHighlights<'a> {
    pub session_id: &'a str,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStatus<'a> {
    pub session_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInput<'a> {
    pub input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
    pub client_message_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchSession<'a> {
    pub session_id: &'a str,
    pub epoch: u64,
}

// === Response payloads ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<ChoiceOption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_waiting_for_choice: Option<bool>,
}

impl Highlight {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp,
            tool_calls: None,
            options: None,
            is_waiting_for_choice: None,
        }
    }

    /// A client-origin echo not yet confirmed by the daemon.
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(OPTIMISTIC_PREFIX)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightsPage {
    #[serde(default)]
    pub highlights: Vec<Highlight>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub has_more: bool,
}

/// Session status as reported by `get_status` / `status_change`. Fields this
/// client does not interpret are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub is_waiting_for_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_frame_uses_camel_case_request_id() {
        let frame = OutboundFrame::new(GET_STATUS)
            .with_payload(json!({"sessionId": "s1"}))
            .with_request_id("req-1");
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "get_status");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["payload"]["sessionId"], "s1");
        assert!(value.get("token").is_none());
    }

    #[test]
    fn test_ping_frame_is_bare() {
        let json = OutboundFrame::new(PING).to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_inbound_response_parses() {
        let json = r#"{"type":"get_status","success":true,"payload":{"isRunning":true},"requestId":"r9"}"#;
        let frame = InboundFrame::parse(json).unwrap();
        assert_eq!(frame.kind, "get_status");
        assert!(frame.success);
        assert_eq!(frame.request_id.as_deref(), Some("r9"));

        let status: SessionStatus = frame.decode_payload().unwrap();
        assert!(status.is_running);
        assert!(!status.is_waiting_for_input);
    }

    #[test]
    fn test_inbound_without_success_is_failure() {
        let frame = InboundFrame::parse(r#"{"type":"authenticate","requestId":"r1"}"#).unwrap();
        assert!(!frame.success);
        assert_eq!(
            frame.into_result(),
            Err(RequestError::Rejected("request failed".into()))
        );
    }

    #[test]
    fn test_rejected_response_carries_error() {
        let frame = InboundFrame::parse(
            r#"{"type":"authenticate","success":false,"error":"Invalid token","requestId":"r1"}"#,
        )
        .unwrap();
        assert_eq!(
            frame.into_result(),
            Err(RequestError::Rejected("Invalid token".into()))
        );
    }

    #[test]
    fn test_decode_payload_reports_malformed_payload() {
        let frame =
            InboundFrame::parse(r#"{"type":"get_highlights","success":true,"payload":{"highlights":7}}"#)
                .unwrap();
        let result: Result<HighlightsPage, _> = frame.decode_payload();
        assert!(matches!(result, Err(RequestError::Decode(_))));
    }

    #[test]
    fn test_highlights_page_parses() {
        let json = r#"{
            "highlights": [
                {"id":"h1","role":"user","content":"hi","timestamp":1000},
                {"id":"h2","role":"assistant","content":"hello","timestamp":2000,
                 "toolCalls":[{"id":"t1","name":"Bash","input":{"command":"ls"},"status":"completed"}],
                 "isWaitingForChoice":true,
                 "options":[{"label":"Yes"},{"label":"No","description":"abort"}]}
            ],
            "total": 12,
            "hasMore": true
        }"#;
        let page: HighlightsPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.total, 12);
        assert!(page.has_more);
        assert_eq!(page.highlights[0].role, Role::User);
        let h2 = &page.highlights[1];
        assert_eq!(h2.tool_calls.as_ref().unwrap()[0].status.as_deref(), Some("completed"));
        assert_eq!(h2.is_waiting_for_choice, Some(true));
        assert_eq!(h2.options.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_status_keeps_unknown_fields() {
        let status: SessionStatus =
            serde_json::from_value(json!({"isRunning": false, "model": "opus"})).unwrap();
        assert_eq!(status.extra.get("model"), Some(&json!("opus")));
    }

    #[test]
    fn test_optimistic_prefix_detection() {
        let local = Highlight::new("optimistic-abc", Role::User, "hi", 0);
        let server = Highlight::new("msg-1", Role::User, "hi", 0);
        assert!(local.is_optimistic());
        assert!(!server.is_optimistic());
    }

    #[test]
    fn test_server_event_conversation_update() {
        let frame =
            InboundFrame::parse(r#"{"type":"conversation_update","sessionId":"s1"}"#).unwrap();
        let event = ServerEvent::from_frame(frame);
        assert!(matches!(event, ServerEvent::ConversationUpdate { .. }));
        assert_eq!(event.session_id(), Some("s1"));
        assert!(event.concerns("s1"));
        assert!(!event.concerns("s2"));
    }

    #[test]
    fn test_server_event_status_change_from_payload_scope() {
        let frame = InboundFrame::parse(
            r#"{"type":"status_change","payload":{"sessionId":"s2","status":{"isWaitingForInput":true}}}"#,
        )
        .unwrap();
        match ServerEvent::from_frame(frame) {
            ServerEvent::StatusChange { session_id, status } => {
                assert_eq!(session_id.as_deref(), Some("s2"));
                assert!(status.unwrap().is_waiting_for_input);
            }
            other => panic!("Expected StatusChange, got {other:?}"),
        }
    }

    #[test]
    fn test_unscoped_event_concerns_every_session() {
        let frame = InboundFrame::parse(r#"{"type":"status_change"}"#).unwrap();
        let event = ServerEvent::from_frame(frame);
        assert!(event.concerns("anything"));
    }

    #[test]
    fn test_unknown_broadcast_falls_through() {
        let frame = InboundFrame::parse(r#"{"type":"tmux_layout","payload":{"panes":3}}"#).unwrap();
        match ServerEvent::from_frame(frame) {
            ServerEvent::Unknown(frame) => assert_eq!(frame.kind, "tmux_layout"),
            other => panic!("Expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_send_input_payload_shape() {
        let payload = serde_json::to_value(SendInput {
            input: "ls",
            session_id: Some("s1"),
            client_message_id: "m1",
        })
        .unwrap();
        assert_eq!(payload, json!({"input":"ls","sessionId":"s1","clientMessageId":"m1"}));
    }
}

//! Boundary events between the ptymux server and its clients.
//!
//! Every event travels as one JSON object tagged by `"type"`. Event names are
//! kebab-case and payload fields camelCase, matching what the browser
//! client emits.

use serde::{Deserialize, Serialize};

/// Public identity of a session: what every client sees in its session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to a session's output, leaving the previous one.
    #[serde(rename_all = "camelCase")]
    SwitchSession { session_id: String },

    /// Spawn a new session. `request_id` is echoed in the ack.
    #[serde(rename_all = "camelCase")]
    CreateSession {
        #[serde(default)]
        request_id: Option<u64>,
    },

    /// Ask a session's process to terminate.
    #[serde(rename_all = "camelCase")]
    CloseSession { session_id: String },

    /// Keystrokes for a session.
    #[serde(rename_all = "camelCase")]
    Input { session_id: String, data: String },

    /// New terminal geometry for a session.
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u32,
        rows: u32,
    },
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full ordered session listing, sent once on connect.
    SessionsList { sessions: Vec<SessionSummary> },

    SessionCreated(SessionSummary),

    SessionClosed(SessionSummary),

    /// Reply to a `create-session` request. `session` is `None` on failure.
    #[serde(rename_all = "camelCase")]
    CreateSessionAck {
        request_id: Option<u64>,
        session: Option<SessionSummary>,
    },

    /// Live PTY output for a subscribed session.
    #[serde(rename_all = "camelCase")]
    Output { session_id: String, data: String },

    /// Scrollback snapshot, delivered once per subscribe.
    #[serde(rename_all = "camelCase")]
    History { session_id: String, data: String },
}

//! WebSocket message types exchanged between chat clients and the bridge.
//!
//! Every frame is a JSON text message tagged by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sse;

// ============================================================================
// Client -> Bridge
// ============================================================================

/// Messages sent by a chat client to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a chat completion. The payload is the body the client would have
    /// POSTed to the chat endpoint.
    Chat { payload: ChatPayload },

    /// Heartbeat. Answered with [`BridgeMessage::Pong`].
    Ping,

    /// Any type this side does not know about.
    #[serde(other)]
    Unknown,
}

/// Body of a chat request.
///
/// Only `messages` is forwarded upstream. Any other fields the client sent are
/// kept in `extra` so a payload survives a decode/encode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatPayload {
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            extra: Map::new(),
        }
    }

    /// JSON body for the upstream chat endpoint.
    pub fn upstream_body(&self) -> Value {
        serde_json::json!({ "messages": self.messages })
    }
}

// ============================================================================
// Bridge -> Client
// ============================================================================

/// Messages sent by the bridge to a chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Reply to [`ClientMessage::Ping`].
    Pong,

    /// Upstream accepted the chat request; chunks follow.
    Start,

    /// One SSE `data:` frame whose payload parsed as JSON.
    Chunk { data: Value },

    /// One SSE `data:` frame whose payload is not JSON (keep-alives, `[DONE]`
    /// markers and similar).
    Raw { data: String },

    /// Upstream stream closed normally.
    Done,

    /// The request failed. Ends the chat session but not the connection.
    Error { error: String },

    /// Any type this side does not know about.
    #[serde(other)]
    Unknown,
}

impl BridgeMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Classify the payload of an SSE `data:` line.
    pub fn from_sse_data(data: &str) -> Self {
        match serde_json::from_str::<Value>(data) {
            Ok(data) => Self::Chunk { data },
            Err(_) => Self::Raw {
                data: data.to_string(),
            },
        }
    }

    /// Classify a complete SSE line. Returns `None` for anything that is not a
    /// non-empty `data:` line.
    pub fn from_sse_line(line: &str) -> Option<Self> {
        sse::data_payload(line).map(Self::from_sse_data)
    }

    /// Re-encode a `chunk`/`raw` message as the SSE frame it came from.
    pub fn to_sse_frame(&self) -> Option<String> {
        match self {
            Self::Chunk { data } => Some(sse::encode_data_frame(&data.to_string())),
            Self::Raw { data } => Some(sse::encode_data_frame(data)),
            _ => None,
        }
    }

    /// Whether this message ends a chat session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

//! RPC envelopes.
//!
//! Every WebSocket frame carries one UTF-8 JSON envelope. Requests and
//! responses are matched by `id`, so several calls may be in flight on one
//! connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum frame size (1MB). Larger frames are dropped.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One RPC envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        body: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    pub fn request(id: u64, method: &str, body: Value) -> Self {
        Frame::Request {
            id,
            method: method.to_string(),
            body,
        }
    }

    pub fn ok(id: u64, result: Value) -> Self {
        Frame::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Frame::Response {
            id,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Serialize to JSON text for sending as a text frame.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Try to parse an envelope from frame data.
    ///
    /// Returns None if the data is not valid UTF-8 JSON or not an envelope.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        serde_json::from_str(text).ok()
    }
}

//! Wire protocol for client-server communication.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Server command that forces the client to close its connection.
pub const CMD_WS_CLOSE: &str = "wsClose";
/// Server command carrying the access id for this connection.
pub const CMD_SET_USER_ACCESS_ID: &str = "SetUserAccessId";
/// Keepalive control command.
pub const CMD_PING: &str = "ping";
/// Data key holding the assigned access id.
pub const ACCESS_ID_KEY: &str = "access_id";

/// A single transport frame. The frame type selects the decode path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Uncompressed JSON.
    Text(String),
    /// Compressed JSON.
    Binary(Vec<u8>),
}

impl Frame {
    /// Size of the frame payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// Whether the frame payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a binary (compressed) frame.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Command name.
    #[serde(rename = "cmd")]
    pub command: String,
    /// Command payload.
    #[serde(rename = "data", default)]
    pub payload: HashMap<String, String>,
    /// Access id assigned by the server, empty until assigned.
    #[serde(rename = "request_user_access_id", default)]
    pub access_id: String,
}

impl OutboundMessage {
    /// Create an outbound message stamped with an access id.
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        payload: HashMap<String, String>,
        access_id: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            payload,
            access_id: access_id.into(),
        }
    }

    /// Keepalive ping.
    #[must_use]
    pub fn ping(access_id: impl Into<String>) -> Self {
        Self::new(CMD_PING, HashMap::new(), access_id)
    }
}

/// Message from server to client.
///
/// This is the canonical decoded shape regardless of wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Command name.
    pub cmd: String,
    /// Status code reported by the server.
    #[serde(rename = "status", default)]
    pub status_code: i64,
    /// Whether the command succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Optional human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional command data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl InboundMessage {
    /// Create a message with no data.
    #[must_use]
    pub fn new(cmd: impl Into<String>, ok: bool) -> Self {
        Self {
            cmd: cmd.into(),
            status_code: if ok { 200 } else { 400 },
            ok,
            message: None,
            data: None,
        }
    }

    /// Builder: add a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get a raw data field.
    #[must_use]
    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// String view of a data field.
    ///
    /// Strings are returned as-is, numbers and booleans are stringified.
    /// Null, arrays and objects yield `None`.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<String> {
        match self.data_value(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Whether a data field is present and non-empty.
    #[must_use]
    pub fn has_data(&self, key: &str) -> bool {
        self.data_str(key).is_some_and(|s| !s.is_empty())
    }
}

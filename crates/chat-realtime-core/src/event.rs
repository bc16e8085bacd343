//! Typed events published by a realtime session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coalescer::TextUpdate;
use crate::protocol::InboundMessage;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection has been attempted.
    #[default]
    Idle,
    /// Physical connection is being opened.
    Connecting,
    /// Connection is open.
    Open,
    /// Existing connection is being replaced.
    Reconnecting,
    /// Connection is closed.
    Closed,
}

impl ConnectionState {
    /// Whether the connection is Connecting or Open.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of session state for UI affordances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Connection state of the current session.
    pub state: ConnectionState,
    /// Backpressure flag: a caller-initiated request is outstanding.
    pub waiting: bool,
    /// Whether the server has assigned an access id.
    pub access_id_assigned: bool,
    /// Epoch of the current session (0 before the first connect).
    pub epoch: u64,
}

impl SessionStatus {
    /// Whether input affordances should be enabled.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Open && !self.waiting
    }
}

/// Notification category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Connection opened.
    Connected,
    /// Connection closed.
    Disconnected,
    /// Automatic reconnect started.
    Reconnecting,
    /// Transport failed to open or errored.
    ConnectionError,
    /// An inbound frame could not be decoded.
    DecodeError,
    /// A feature command reported failure.
    ReceiveError,
}

impl NotificationKind {
    /// Whether this notification reports a failure.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(
            self,
            Self::ConnectionError | Self::DecodeError | Self::ReceiveError
        )
    }
}

/// Transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Category.
    pub kind: NotificationKind,
    /// Short description.
    pub detail: String,
}

impl Notification {
    /// Create a notification.
    #[must_use]
    pub fn new(kind: NotificationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Event published by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Inbound message forwarded to the feature layer.
    Message(InboundMessage),
    /// Coalesced text update.
    Text(TextUpdate),
    /// Transient notification.
    Notice(Notification),
    /// Connection state transition.
    State(ConnectionState),
}

impl SessionEvent {
    /// Approximate heap size, used for history bounding.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        match self {
            Self::Message(m) => {
                OVERHEAD
                    + m.cmd.len()
                    + m.message.as_ref().map_or(0, String::len)
                    + m.data
                        .as_ref()
                        .map_or(0, |d| serde_json::to_string(d).map_or(0, |s| s.len()))
            }
            Self::Text(t) => OVERHEAD + t.message_id.len() + t.text.len(),
            Self::Notice(n) => OVERHEAD + n.detail.len(),
            Self::State(_) => OVERHEAD,
        }
    }
}

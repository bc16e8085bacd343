//! Single-flight backpressure gate.
//!
//! At most one caller-initiated command may be outstanding. The system path
//! (keepalive, control traffic) goes through the same dispatch table but
//! never checks or sets the flag.

use chat_realtime_core::ConnectionState;

/// Which send path a command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    /// Caller-initiated, gated.
    Caller,
    /// Control traffic, bypasses the gate.
    System,
}

/// What to do with a send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Transmit now.
    Admit,
    /// A caller request is outstanding; ignore.
    Busy,
    /// Connection is still opening; ignore.
    Wait,
    /// No usable connection; reconnect and drop the request.
    Reconnect,
}

/// Result of a send attempt, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// A frame was handed to the transport.
    Sent,
    /// Ignored: a caller request is already in flight.
    Busy,
    /// Ignored: the connection is still opening.
    Pending,
    /// Dropped: a reconnect was triggered instead. Retry once open.
    Reconnecting,
    /// Dropped: issued against a session that is no longer current.
    Stale,
    /// The frame could not be encoded or handed to the transport.
    Failed(String),
}

impl SendOutcome {
    /// Whether a frame went out.
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Decide how to handle a send given the current session state.
#[must_use]
pub const fn admit(state: Option<ConnectionState>, waiting: bool, path: SendPath) -> GateDecision {
    match (state, path) {
        (Some(ConnectionState::Open), SendPath::System) => GateDecision::Admit,
        (Some(ConnectionState::Open), SendPath::Caller) => {
            if waiting {
                GateDecision::Busy
            } else {
                GateDecision::Admit
            }
        }
        (Some(ConnectionState::Connecting), _) => GateDecision::Wait,
        (
            None
            | Some(ConnectionState::Idle | ConnectionState::Reconnecting | ConnectionState::Closed),
            _,
        ) => GateDecision::Reconnect,
    }
}

/// The backpressure flag.
#[derive(Debug, Default)]
pub struct Backpressure {
    waiting: bool,
}

impl Backpressure {
    /// Create a cleared flag.
    #[must_use]
    pub const fn new() -> Self {
        Self { waiting: false }
    }

    /// Whether a caller request is outstanding.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.waiting
    }

    /// Mark a caller request as outstanding.
    pub fn acquire(&mut self) {
        self.waiting = true;
    }

    /// Clear the flag. Returns whether it was set.
    pub fn release(&mut self) -> bool {
        std::mem::replace(&mut self.waiting, false)
    }
}

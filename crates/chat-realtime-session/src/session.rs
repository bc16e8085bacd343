//! One physical connection lifetime.

use chat_realtime_core::{
    Connection, ConnectionState, Epoch, Frame, ReadyState, TransportError,
};

/// One logical connection attempt.
///
/// A new `Session` is created for every connect; the old one is discarded,
/// never reused.
pub struct Session {
    epoch: Epoch,
    connection: Box<dyn Connection>,
    state: ConnectionState,
    access_id: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .field("access_id", &self.access_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap a freshly started connection.
    #[must_use]
    pub fn new(epoch: Epoch, connection: Box<dyn Connection>) -> Self {
        Self {
            epoch,
            connection,
            state: ConnectionState::Connecting,
            access_id: String::new(),
        }
    }

    /// Connection epoch.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transport ready state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.connection.ready_state()
    }

    /// Set the connection state. Returns whether it changed.
    pub fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        tracing::debug!(epoch = self.epoch, from = %self.state, to = %state, "session state");
        self.state = state;
        true
    }

    /// Access id, empty until assigned.
    #[must_use]
    pub fn access_id(&self) -> &str {
        &self.access_id
    }

    /// Store the server-assigned access id.
    pub fn set_access_id(&mut self, access_id: impl Into<String>) {
        self.access_id = access_id.into();
    }

    /// Hand a frame to the transport.
    ///
    /// # Errors
    /// Returns error if the transport rejects the frame.
    pub fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.connection.send(frame)
    }

    /// Close the connection if it is Connecting or Open.
    ///
    /// Returns whether a close was issued. The state is left to the caller.
    pub fn close(&mut self) -> bool {
        if !self.state.is_live() {
            return false;
        }
        self.connection.close();
        true
    }
}

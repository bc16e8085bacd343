//! Core traits for transports and credentials.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Frame;

/// Identifier of one physical connection attempt.
///
/// Every connect allocates a new, strictly larger epoch.
pub type Epoch = u64;

/// Transport-level ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Opening.
    Connecting,
    /// Open.
    Open,
    /// Close requested, not yet complete.
    Closing,
    /// Closed.
    Closed,
}

/// Event reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection opened.
    Open,
    /// A frame arrived.
    Frame(Frame),
    /// The transport failed.
    Error(String),
    /// The connection closed. Always the last event of a connection.
    Close {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
}

/// Transport event tagged with the connection it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochEvent {
    /// Connection epoch.
    pub epoch: Epoch,
    /// Event.
    pub event: TransportEvent,
}

/// Channel transports report events on.
pub type EventSink = mpsc::UnboundedSender<EpochEvent>;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Connection not open")]
    NotOpen,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
}

/// Handle to one physical duplex connection.
pub trait Connection: Send {
    /// Queue a frame for transmission.
    ///
    /// # Errors
    /// Returns error if the connection is not open. The frame is dropped.
    fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Request close. Idempotent.
    fn close(&mut self);

    /// Current ready state.
    fn ready_state(&self) -> ReadyState;
}

/// Opens physical connections.
pub trait Connector: Send + Sync {
    /// Start opening a connection to `url`.
    ///
    /// Returns immediately with a connection in [`ReadyState::Connecting`].
    /// Lifecycle events are reported on `events` tagged with `epoch`.
    ///
    /// # Errors
    /// Returns error if the connection cannot even be started.
    fn connect(
        &self,
        url: &str,
        epoch: Epoch,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// Credential error.
#[derive(Debug, Error)]
#[error("Credential unavailable: {0}")]
pub struct CredentialError(pub String);

/// Supplies the credential used to authorize a connection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Bearer credential, or `None` for anonymous connections.
    async fn credential(&self) -> Result<Option<String>, CredentialError>;
}

/// Fixed credential.
#[derive(Debug, Clone)]
pub struct StaticCredential(pub String);

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Result<Option<String>, CredentialError> {
        Ok(Some(self.0.clone()))
    }
}

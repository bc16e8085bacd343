//! Core abstractions for realtime chat sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `protocol` - Wire envelope types
//! - `EnvelopeCodec` - JSON text / Brotli binary framing
//! - `StreamCoalescer` - Batched, ordered streaming text updates
//! - `MsgStore` - Broadcast + history of session events
//! - `RoomContext` / `SessionConfig` - Addressing and tunables
//! - Transport and credential traits

pub mod coalescer;
pub mod codec;
pub mod config;
pub mod context;
pub mod event;
pub mod msg_store;
pub mod protocol;
pub mod traits;

pub use coalescer::{StreamCoalescer, TextUpdate, UpdateMode};
pub use codec::{Brotli, CodecError, Compression, EnvelopeCodec};
pub use config::{ConfigError, SessionConfig};
pub use context::RoomContext;
pub use event::{ConnectionState, Notification, NotificationKind, SessionEvent, SessionStatus};
pub use msg_store::MsgStore;
pub use protocol::{Frame, InboundMessage, OutboundMessage};
pub use traits::{
    Connection, Connector, CredentialProvider, Epoch, EpochEvent, EventSink, ReadyState,
    TransportError, TransportEvent,
};

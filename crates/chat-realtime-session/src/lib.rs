//! Realtime session orchestration for chat rooms.
//!
//! Provides:
//! - `ConnectionManager` - Connection lifecycle state machine
//! - `Dispatcher` / `FeatureHandler` - Inbound routing
//! - `Backpressure` - Single-flight gate for caller sends
//! - `StreamingTextHandler` - Coalesced streaming replies
//! - `RoomClient` - Async driver and handle

pub mod client;
pub mod dispatcher;
pub mod gate;
pub mod manager;
pub mod session;
pub mod stream_handler;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientError, RoomClient};
pub use dispatcher::{Dispatch, Dispatcher, FeatureHandler, HandlerContext};
pub use gate::{Backpressure, GateDecision, SendOutcome, SendPath};
pub use manager::{ConnectionManager, ReconnectOutcome, Visibility};
pub use session::Session;
pub use stream_handler::{StreamVocabulary, StreamingTextHandler};

//! Transports for realtime chat sessions.
//!
//! Provides:
//! - WebSocket connector (feature: websocket)
//! - Terminal chat view (feature: tui)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "tui")]
pub mod tui;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

#[cfg(feature = "tui")]
pub use tui::{ChatView, UiCommand};

//! Room addressing for realtime sessions.

use serde::{Deserialize, Serialize};

/// Default room path on the backend.
pub const DEFAULT_ROOM_PATH: &str = "ws/llmchat/room/";

/// Addressing context for one room connection.
///
/// One connection per room: the URL is the base URL, a path prefix and the
/// room identifier appended as a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomContext {
    /// Backend base URL (`http(s)://` or `ws(s)://`, scheme optional).
    pub base_url: String,
    /// Path prefix the room id is appended to.
    #[serde(default = "default_path")]
    pub path: String,
    /// Room identifier.
    pub room_id: String,
}

fn default_path() -> String {
    DEFAULT_ROOM_PATH.to_string()
}

impl RoomContext {
    /// Create a context using the default room path.
    #[must_use]
    pub fn new(base_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: default_path(),
            room_id: room_id.into(),
        }
    }

    /// Builder: override the path prefix.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// WebSocket URL for this room.
    ///
    /// `https`/`wss` map to `wss`, everything else to `ws`.
    #[must_use]
    pub fn url(&self) -> String {
        let base = self.base_url.trim();
        let (secure, host) = match base.split_once("://") {
            Some((scheme, rest)) => (
                matches!(scheme.to_ascii_lowercase().as_str(), "https" | "wss"),
                rest,
            ),
            None => (false, base),
        };
        let scheme = if secure { "wss" } else { "ws" };
        let host = host.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        format!("{scheme}://{host}/{path}{}", self.room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_mapping() {
        assert_eq!(
            RoomContext::new("https://chat.example.com", "r1").url(),
            "wss://chat.example.com/ws/llmchat/room/r1"
        );
        assert_eq!(
            RoomContext::new("http://localhost:8000/", "r1").url(),
            "ws://localhost:8000/ws/llmchat/room/r1"
        );
        assert_eq!(
            RoomContext::new("WSS://chat.example.com", "r1").url(),
            "wss://chat.example.com/ws/llmchat/room/r1"
        );
    }

    #[test]
    fn test_url_without_scheme() {
        assert_eq!(
            RoomContext::new("localhost:8000", "abc").url(),
            "ws://localhost:8000/ws/llmchat/room/abc"
        );
    }

    #[test]
    fn test_custom_path() {
        let ctx = RoomContext::new("https://h", "9").with_path("/ws/vrmchat/room/");
        assert_eq!(ctx.url(), "wss://h/ws/vrmchat/room/9");
    }
}

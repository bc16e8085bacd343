//! Broadcast + history event store for a room session.

use std::{collections::VecDeque, sync::RwLock};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    coalescer::TextUpdate,
    event::{Notification, SessionEvent},
    protocol::InboundMessage,
};

/// Default history size limit (8 MB).
pub const DEFAULT_HISTORY_BYTES: usize = 8 * 1024 * 1024;

/// Live channel capacity.
const CHANNEL_CAPACITY: usize = 10_000;

#[derive(Clone)]
struct StoredEvent {
    event: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
    latest_message: Option<InboundMessage>,
}

/// Event store with broadcast and history support.
///
/// Consumers that attach late (a UI re-mounting, a second view of the same
/// room) receive history then switch to live events.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
    history_bytes: usize,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    /// Create a new store with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_BYTES)
    }

    /// Create a new store keeping at most `history_bytes` of history.
    #[must_use]
    pub fn with_history_limit(history_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                latest_message: None,
            }),
            sender,
            history_bytes,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone()); // live listeners
        let bytes = event.approx_bytes();

        let Ok(mut inner) = self.inner.write() else {
            tracing::error!("message store lock poisoned, dropping event from history");
            return;
        };
        if let SessionEvent::Message(msg) = &event {
            inner.latest_message = Some(msg.clone());
        }
        while inner.total_bytes.saturating_add(bytes) > self.history_bytes {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push a forwarded inbound message.
    pub fn push_message(&self, msg: InboundMessage) {
        self.push(SessionEvent::Message(msg));
    }

    /// Push a coalesced text update.
    pub fn push_text(&self, update: TextUpdate) {
        self.push(SessionEvent::Text(update));
    }

    /// Push a notification.
    pub fn push_notice(&self, notice: Notification) {
        self.push(SessionEvent::Notice(notice));
    }

    /// Latest inbound message forwarded to the feature layer.
    #[must_use]
    pub fn latest_message(&self) -> Option<InboundMessage> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.latest_message.clone())
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .map(|inner| inner.history.iter().map(|s| s.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Notifications recorded in history.
    #[must_use]
    pub fn notices(&self) -> Vec<Notification> {
        self.get_history()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Notice(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("session event stream lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }

    /// Live stream of coalesced text updates.
    #[must_use]
    pub fn text_stream(&self) -> futures::stream::BoxStream<'static, TextUpdate> {
        BroadcastStream::new(self.get_receiver())
            .filter_map(|res| {
                future::ready(match res {
                    Ok(SessionEvent::Text(update)) => Some(update),
                    _ => None,
                })
            })
            .boxed()
    }
}

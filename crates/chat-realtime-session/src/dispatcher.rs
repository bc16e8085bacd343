//! Inbound message dispatch.
//!
//! Two session-level commands are handled here and never forwarded:
//! `wsClose` and `SetUserAccessId` (with an id). Both clear the backpressure
//! flag. Everything else goes to the registered feature handler, which owns
//! clearing the flag for its own responses.

use chat_realtime_core::{
    InboundMessage, MsgStore, Notification, NotificationKind, StreamCoalescer, TextUpdate,
    protocol::{ACCESS_ID_KEY, CMD_SET_USER_ACCESS_ID, CMD_WS_CLOSE},
};

use crate::gate::Backpressure;
use crate::session::Session;

/// What the dispatcher did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// `wsClose`: the connection was closed.
    ForcedClose,
    /// `SetUserAccessId` accepted; the id is stored on the session.
    AccessIdAssigned(String),
    /// `SetUserAccessId` with `ok: false`.
    AccessIdRejected,
    /// Handed to the feature handler.
    Forwarded,
    /// No feature handler registered.
    Unhandled,
}

/// Feature-level command handler.
///
/// Implementations must clear the backpressure flag (via
/// [`HandlerContext::release`]) once the response to their command is
/// complete, including on failure. Forgetting to do so leaves the caller's
/// input disabled until the connection closes.
pub trait FeatureHandler: Send {
    /// Handle one forwarded message.
    fn handle(&mut self, msg: &InboundMessage, ctx: &mut HandlerContext<'_>);
}

impl<F> FeatureHandler for F
where
    F: FnMut(&InboundMessage, &mut HandlerContext<'_>) + Send,
{
    fn handle(&mut self, msg: &InboundMessage, ctx: &mut HandlerContext<'_>) {
        self(msg, ctx);
    }
}

/// Session resources a feature handler may touch.
pub struct HandlerContext<'a> {
    gate: &'a mut Backpressure,
    coalescer: &'a mut StreamCoalescer,
    store: &'a MsgStore,
    access_id: &'a str,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        gate: &'a mut Backpressure,
        coalescer: &'a mut StreamCoalescer,
        store: &'a MsgStore,
        access_id: &'a str,
    ) -> Self {
        Self {
            gate,
            coalescer,
            store,
            access_id,
        }
    }

    /// Clear the backpressure flag.
    pub fn release(&mut self) {
        self.gate.release();
    }

    /// Whether a caller request is outstanding.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.gate.is_set()
    }

    /// Access id of the current session.
    #[must_use]
    pub const fn access_id(&self) -> &str {
        self.access_id
    }

    /// Buffer a streamed fragment for `message_id`.
    pub fn push_fragment(&mut self, message_id: &str, fragment: &str) -> bool {
        self.coalescer.push(message_id, fragment)
    }

    /// Finish a stream with its authoritative text.
    pub fn finish_stream(&mut self, message_id: &str, final_text: &str) {
        let updates = self.coalescer.finish(message_id, final_text);
        self.publish(updates);
    }

    /// Finish a stream whose buffered fragments are the final text.
    pub fn complete_stream(&mut self, message_id: &str) {
        let updates = self.coalescer.complete(message_id);
        self.publish(updates);
    }

    /// Raise a notification.
    pub fn notify(&mut self, kind: NotificationKind, detail: impl Into<String>) {
        self.store.push_notice(Notification::new(kind, detail));
    }

    fn publish(&self, updates: Vec<TextUpdate>) {
        for update in updates {
            self.store.push_text(update);
        }
    }
}

/// Routes decoded inbound messages.
#[derive(Default)]
pub struct Dispatcher {
    handler: Option<Box<dyn FeatureHandler>>,
}

impl Dispatcher {
    /// Create a dispatcher with no feature handler.
    #[must_use]
    pub fn new() -> Self {
        Self { handler: None }
    }

    /// Register the feature handler, replacing any previous one.
    pub fn register(&mut self, handler: Box<dyn FeatureHandler>) {
        self.handler = Some(handler);
    }

    /// Remove the feature handler.
    pub fn unregister(&mut self) {
        self.handler = None;
    }

    /// Dispatch one message.
    pub fn dispatch(
        &mut self,
        msg: InboundMessage,
        session: &mut Session,
        gate: &mut Backpressure,
        coalescer: &mut StreamCoalescer,
        store: &MsgStore,
    ) -> Dispatch {
        if msg.cmd == CMD_WS_CLOSE {
            tracing::info!(epoch = session.epoch(), "server requested close");
            session.close();
            gate.release();
            return Dispatch::ForcedClose;
        }

        if msg.cmd == CMD_SET_USER_ACCESS_ID && msg.has_data(ACCESS_ID_KEY) {
            gate.release();
            if !msg.ok {
                tracing::warn!(status = msg.status_code, "access id rejected");
                store.push_notice(Notification::new(
                    NotificationKind::ConnectionError,
                    msg.message.unwrap_or_else(|| "access id rejected".into()),
                ));
                return Dispatch::AccessIdRejected;
            }
            let access_id = msg.data_str(ACCESS_ID_KEY).unwrap_or_default();
            tracing::debug!(epoch = session.epoch(), "access id assigned");
            session.set_access_id(access_id.clone());
            return Dispatch::AccessIdAssigned(access_id);
        }

        store.push_message(msg.clone());

        let Some(handler) = self.handler.as_mut() else {
            tracing::debug!(cmd = %msg.cmd, "no feature handler registered");
            return Dispatch::Unhandled;
        };
        let mut ctx = HandlerContext::new(gate, coalescer, store, session.access_id());
        handler.handle(&msg, &mut ctx);
        Dispatch::Forwarded
    }
}

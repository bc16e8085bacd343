//! Feature handler for streamed assistant replies.
//!
//! A reply arrives as a series of fragment messages sharing a message id,
//! followed by one terminal message. Fragments go through the stream
//! coalescer and the terminal message finalizes the visible text. Every
//! fragment clears the backpressure flag unless the handler is told to hold
//! it until the terminal message.

use chat_realtime_core::{InboundMessage, NotificationKind};

use crate::dispatcher::{FeatureHandler, HandlerContext};

/// Command names and data keys of the streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamVocabulary {
    /// Command carrying one fragment.
    pub fragment_cmd: String,
    /// Command marking the end of a stream.
    pub complete_cmd: String,
    /// Data key of the logical message id.
    pub id_key: String,
    /// Data key of the fragment text.
    pub fragment_key: String,
    /// Data key of the final text on the terminal message.
    pub final_key: String,
}

impl Default for StreamVocabulary {
    fn default() -> Self {
        Self {
            fragment_cmd: "SendUserMessage".into(),
            complete_cmd: "isStreamingComplete".into(),
            id_key: "messageId".into(),
            fragment_key: "llmResponse".into(),
            final_key: "llmResponse".into(),
        }
    }
}

/// Streams assistant replies into coalesced text updates.
///
/// Messages outside the streaming vocabulary go to the fallback handler if
/// one is set; otherwise they are treated as complete responses and the
/// backpressure flag is cleared.
#[derive(Default)]
pub struct StreamingTextHandler {
    vocabulary: StreamVocabulary,
    fallback: Option<Box<dyn FeatureHandler>>,
    hold_until_complete: bool,
}

impl StreamingTextHandler {
    /// Handler with the default vocabulary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different vocabulary.
    #[must_use]
    pub fn with_vocabulary(mut self, vocabulary: StreamVocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    /// Delegate other commands to `fallback`.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Box<dyn FeatureHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Keep the backpressure flag set across fragments and clear it only on
    /// the terminal message. A server that never sends the terminal message
    /// then blocks sends until the connection closes.
    #[must_use]
    pub fn hold_until_complete(mut self, hold: bool) -> Self {
        self.hold_until_complete = hold;
        self
    }

    fn on_fragment(&self, msg: &InboundMessage, ctx: &mut HandlerContext<'_>) {
        if !msg.ok {
            ctx.release();
            ctx.notify(
                NotificationKind::ReceiveError,
                msg.message.clone().unwrap_or_else(|| "response failed".into()),
            );
            return;
        }

        let (Some(id), Some(fragment)) = (
            msg.data_str(&self.vocabulary.id_key),
            msg.data_str(&self.vocabulary.fragment_key),
        ) else {
            tracing::warn!(cmd = %msg.cmd, "fragment without message id or text");
            ctx.release();
            ctx.notify(NotificationKind::ReceiveError, "malformed fragment");
            return;
        };

        ctx.push_fragment(&id, &fragment);
        if !self.hold_until_complete {
            ctx.release();
        }
    }

    fn on_complete(&self, msg: &InboundMessage, ctx: &mut HandlerContext<'_>) {
        ctx.release();

        let Some(id) = msg.data_str(&self.vocabulary.id_key) else {
            tracing::warn!(cmd = %msg.cmd, "terminal message without message id");
            return;
        };

        if !msg.ok {
            // Failed streams keep what was received; the final text is not applied.
            ctx.complete_stream(&id);
            ctx.notify(
                NotificationKind::ReceiveError,
                msg.message.clone().unwrap_or_else(|| "stream ended with error".into()),
            );
            return;
        }

        match msg.data_str(&self.vocabulary.final_key) {
            Some(final_text) => ctx.finish_stream(&id, &final_text),
            None => ctx.complete_stream(&id),
        }
    }
}

impl FeatureHandler for StreamingTextHandler {
    fn handle(&mut self, msg: &InboundMessage, ctx: &mut HandlerContext<'_>) {
        if msg.cmd == self.vocabulary.fragment_cmd {
            self.on_fragment(msg, ctx);
        } else if msg.cmd == self.vocabulary.complete_cmd {
            self.on_complete(msg, ctx);
        } else if let Some(fallback) = self.fallback.as_mut() {
            fallback.handle(msg, ctx);
        } else {
            ctx.release();
        }
    }
}

//! Stream coalescing for token-by-token responses.
//!
//! Fragments are buffered per logical message id and released as one batch
//! when the flush deadline passes. A terminal event for an id cancels the
//! pending deadline, discards that id's buffer and replaces the visible text
//! with the authoritative final content.
//!
//! The coalescer owns no timer task. It records the deadline and the owner
//! (the session driver) sleeps until [`StreamCoalescer::flush_deadline`] and
//! then calls [`StreamCoalescer::flush`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Default flush delay (50 ms).
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(50);

/// Number of finished stream ids remembered for dropping late fragments.
pub const FINISHED_CAPACITY: usize = 256;

/// How a [`TextUpdate`] applies to the visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Append to the current text.
    Append,
    /// Replace the current text.
    Replace,
}

/// A coalesced update to one visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextUpdate {
    /// Logical message id.
    pub message_id: String,
    /// Append or replace.
    pub mode: UpdateMode,
    /// Text to apply.
    pub text: String,
}

impl TextUpdate {
    /// Append update.
    #[must_use]
    pub fn append(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            mode: UpdateMode::Append,
            text: text.into(),
        }
    }

    /// Replace update.
    #[must_use]
    pub fn replace(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            mode: UpdateMode::Replace,
            text: text.into(),
        }
    }

    /// Apply this update to a visible text buffer.
    pub fn apply_to(&self, visible: &mut String) {
        match self.mode {
            UpdateMode::Append => visible.push_str(&self.text),
            UpdateMode::Replace => {
                visible.clear();
                visible.push_str(&self.text);
            }
        }
    }
}

/// Per-session fragment buffer with at most one pending flush deadline.
#[derive(Debug)]
pub struct StreamCoalescer {
    delay: Duration,
    buffer: HashMap<String, String>,
    /// First-arrival order of buffered ids.
    order: Vec<String>,
    deadline: Option<Instant>,
    finished: HashSet<String>,
    /// Finish order of `finished`, oldest first.
    finished_order: VecDeque<String>,
}

impl Default for StreamCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_DELAY)
    }
}

impl StreamCoalescer {
    /// Create a coalescer with the given flush delay.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            buffer: HashMap::new(),
            order: Vec::new(),
            deadline: None,
            finished: HashSet::new(),
            finished_order: VecDeque::new(),
        }
    }

    /// Flush delay.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Pending flush deadline, if any.
    #[must_use]
    pub const fn flush_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether any fragment is waiting to be flushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered text for an id.
    #[must_use]
    pub fn pending(&self, message_id: &str) -> Option<&str> {
        self.buffer.get(message_id).map(String::as_str)
    }

    /// Buffer a fragment.
    ///
    /// Arms the flush deadline if none is pending. Fragments for an id whose
    /// stream already finished are dropped. Returns whether the fragment was
    /// buffered.
    pub fn push(&mut self, message_id: &str, fragment: &str) -> bool {
        if self.finished.contains(message_id) {
            tracing::debug!(message_id, "dropping fragment for finished stream");
            return false;
        }

        match self.buffer.get_mut(message_id) {
            Some(text) => text.push_str(fragment),
            None => {
                self.buffer
                    .insert(message_id.to_string(), fragment.to_string());
                self.order.push(message_id.to_string());
            }
        }

        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.delay);
        }
        true
    }

    /// Release every buffered id as one append batch and clear the deadline.
    pub fn flush(&mut self) -> Vec<TextUpdate> {
        self.deadline = None;
        let mut buffer = std::mem::take(&mut self.buffer);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| {
                let text = buffer.remove(&id)?;
                Some(TextUpdate::append(id, text))
            })
            .collect()
    }

    /// Handle a terminal event for an id.
    ///
    /// Cancels the pending deadline before discarding the id's buffer, so no
    /// later flush can re-append finalized text. Fragments buffered for other
    /// ids are released ahead of the replacement. The last update is always
    /// the replacement for `message_id`.
    pub fn finish(&mut self, message_id: &str, final_text: &str) -> Vec<TextUpdate> {
        self.deadline = None;
        if self.buffer.remove(message_id).is_some() {
            self.order.retain(|id| id != message_id);
        }
        self.mark_finished(message_id);

        let mut updates = self.flush();
        updates.push(TextUpdate::replace(message_id, final_text));
        updates
    }

    /// Handle a terminal event that carries no final text.
    ///
    /// The buffered fragments are the final content: everything is released
    /// immediately and later fragments for `message_id` are dropped.
    pub fn complete(&mut self, message_id: &str) -> Vec<TextUpdate> {
        self.mark_finished(message_id);
        self.flush()
    }

    fn mark_finished(&mut self, message_id: &str) {
        if !self.finished.insert(message_id.to_string()) {
            return;
        }
        self.finished_order.push_back(message_id.to_string());
        while self.finished_order.len() > FINISHED_CAPACITY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Whether the stream for an id has finished.
    #[must_use]
    pub fn is_finished(&self, message_id: &str) -> bool {
        self.finished.contains(message_id)
    }

    /// Drop all buffered text, the deadline and finished-stream tracking.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.buffer.clear();
        self.order.clear();
        self.finished.clear();
        self.finished_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(updates: &[TextUpdate], visible: &mut HashMap<String, String>) {
        for update in updates {
            update.apply_to(visible.entry(update.message_id.clone()).or_default());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fragment_arms_deadline_once() {
        let mut c = StreamCoalescer::default();
        let start = Instant::now();

        assert!(c.push("abc", "Hel"));
        let deadline = c.flush_deadline().unwrap();
        assert_eq!(deadline, start + DEFAULT_FLUSH_DELAY);

        tokio::time::advance(Duration::from_millis(20)).await;
        c.push("abc", "lo");
        assert_eq!(c.flush_deadline(), Some(deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_appends_in_arrival_order() {
        let mut c = StreamCoalescer::default();
        c.push("abc", "Hel");
        c.push("abc", "lo");

        let updates = c.flush();
        assert_eq!(updates, vec![TextUpdate::append("abc", "Hello")]);
        assert!(c.is_empty());
        assert!(c.flush_deadline().is_none());
        assert!(c.flush().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_ids_share_one_batch() {
        let mut c = StreamCoalescer::default();
        c.push("m1", "a");
        c.push("m2", "x");
        c.push("m1", "b");
        c.push("m2", "y");

        let updates = c.flush();
        assert_eq!(
            updates,
            vec![TextUpdate::append("m1", "ab"), TextUpdate::append("m2", "xy")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_wins_over_buffered_fragments() {
        let mut c = StreamCoalescer::default();
        let mut visible = HashMap::new();

        c.push("abc", "Hel");
        c.push("abc", "lo");
        let updates = c.finish("abc", "Hello, world!");
        render(&updates, &mut visible);

        assert!(c.flush_deadline().is_none());
        assert!(c.pending("abc").is_none());

        // A flush firing afterwards must not re-append.
        render(&c.flush(), &mut visible);
        assert_eq!(visible["abc"], "Hello, world!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_after_partial_flush() {
        let mut c = StreamCoalescer::default();
        let mut visible = HashMap::new();

        c.push("abc", "Hel");
        render(&c.flush(), &mut visible);
        assert_eq!(visible["abc"], "Hel");

        c.push("abc", "lo");
        render(&c.finish("abc", "Hello, world!"), &mut visible);
        assert_eq!(visible["abc"], "Hello, world!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_releases_other_ids() {
        let mut c = StreamCoalescer::default();
        c.push("m1", "partial");
        c.push("m2", "dropped");

        let updates = c.finish("m2", "final");
        assert_eq!(
            updates,
            vec![
                TextUpdate::append("m1", "partial"),
                TextUpdate::replace("m2", "final"),
            ]
        );
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fragment_after_terminal_is_dropped() {
        let mut c = StreamCoalescer::default();
        c.finish("abc", "done");

        assert!(!c.push("abc", "late"));
        assert!(c.flush_deadline().is_none());
        assert!(c.is_finished("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_releases_buffer_as_final() {
        let mut c = StreamCoalescer::default();
        c.push("abc", "Hel");
        c.push("abc", "lo");

        let updates = c.complete("abc");
        assert_eq!(updates, vec![TextUpdate::append("abc", "Hello")]);
        assert!(c.flush_deadline().is_none());
        assert!(!c.push("abc", "!"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_everything() {
        let mut c = StreamCoalescer::default();
        c.push("abc", "x");
        c.finish("old", "y");
        c.cancel();

        assert!(c.is_empty());
        assert!(c.flush_deadline().is_none());
        assert!(!c.is_finished("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_ids_stay_bounded() {
        let mut c = StreamCoalescer::default();
        for i in 0..10_000 {
            let id = format!("m{i}");
            c.push(&id, "x");
            c.finish(&id, "done");
        }
        c.flush();

        assert_eq!(c.finished.len(), FINISHED_CAPACITY);
        assert_eq!(c.finished_order.len(), FINISHED_CAPACITY);
        assert!(c.is_finished("m9999"));
        assert!(!c.is_finished("m0"));
        assert!(!c.push("m9999", "late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishing_twice_records_once() {
        let mut c = StreamCoalescer::default();
        c.finish("abc", "a");
        c.complete("abc");
        assert_eq!(c.finished_order.len(), 1);
    }

    #[test]
    fn test_apply_modes() {
        let mut text = String::from("Hel");
        TextUpdate::append("a", "lo").apply_to(&mut text);
        assert_eq!(text, "Hello");
        TextUpdate::replace("a", "Bye").apply_to(&mut text);
        assert_eq!(text, "Bye");
    }
}

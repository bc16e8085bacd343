//! Terminal chat view for ratatui applications.
//!
//! [`ChatView`] folds session events into a transcript, tracks the input
//! line and maps crossterm key events to [`UiCommand`]s.

use std::collections::HashMap;

use chat_realtime_core::{ConnectionState, NotificationKind, SessionEvent, SessionStatus};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::{
    Frame,
    layout::{Constraint, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Paragraph, Wrap},
};

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    /// Local user.
    User,
    /// Streamed reply.
    Assistant,
    /// Connection notices.
    System,
    /// Failure notices.
    Alert,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Author.
    pub author: Author,
    /// Visible text.
    pub text: String,
}

/// Action requested by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    /// Send the input line.
    Submit(String),
    /// Force a reconnect.
    Reconnect,
    /// Leave the application.
    Quit,
}

/// Transcript, status and input line.
#[derive(Debug, Default)]
pub struct ChatView {
    lines: Vec<ChatLine>,
    streams: HashMap<String, usize>,
    status: SessionStatus,
    input: String,
    title: String,
}

impl ChatView {
    /// Empty view titled `title`.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Transcript lines.
    #[must_use]
    pub fn lines(&self) -> &[ChatLine] {
        &self.lines
    }

    /// Current input line.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Last status applied.
    #[must_use]
    pub const fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Replace the status snapshot.
    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    /// Record a message typed by the local user.
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.lines.push(ChatLine {
            author: Author::User,
            text: text.into(),
        });
    }

    /// Fold one session event into the view.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Text(update) => {
                let index = *self
                    .streams
                    .entry(update.message_id.clone())
                    .or_insert_with(|| {
                        self.lines.push(ChatLine {
                            author: Author::Assistant,
                            text: String::new(),
                        });
                        self.lines.len() - 1
                    });
                update.apply_to(&mut self.lines[index].text);
            }
            SessionEvent::Notice(notice) => {
                if notice.kind == NotificationKind::Connected {
                    return;
                }
                let author = if notice.kind.is_error() {
                    Author::Alert
                } else {
                    Author::System
                };
                self.lines.push(ChatLine {
                    author,
                    text: notice.detail.clone(),
                });
            }
            SessionEvent::State(state) => self.status.state = *state,
            SessionEvent::Message(_) => {}
        }
    }

    /// Handle a terminal event. Editing keys are consumed here.
    pub fn handle_event(&mut self, event: &Event) -> Option<UiCommand> {
        match event {
            Event::Key(key) if key.kind != KeyEventKind::Release => self.handle_key(key),
            Event::Paste(text) => {
                self.input.push_str(text);
                None
            }
            _ => None,
        }
    }

    fn handle_key(&mut self, key: &KeyEvent) -> Option<UiCommand> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c' | 'd') if ctrl => Some(UiCommand::Quit),
            KeyCode::Char('r') if ctrl => Some(UiCommand::Reconnect),
            KeyCode::Char(c) => {
                self.input.push(c);
                None
            }
            KeyCode::Backspace => {
                self.input.pop();
                None
            }
            KeyCode::Enter => {
                let text = self.input.trim().to_string();
                if text.is_empty() {
                    return None;
                }
                // Keep the input while a request is outstanding; the send
                // would be ignored anyway.
                if !self.status.can_send() {
                    return None;
                }
                self.input.clear();
                Some(UiCommand::Submit(text))
            }
            KeyCode::Esc => Some(UiCommand::Quit),
            _ => None,
        }
    }

    fn status_line(&self) -> Line<'_> {
        let (label, color) = match self.status.state {
            ConnectionState::Open if self.status.waiting => ("waiting", Color::Yellow),
            ConnectionState::Open => ("connected", Color::Green),
            ConnectionState::Connecting => ("connecting", Color::Yellow),
            ConnectionState::Reconnecting => ("reconnecting", Color::Yellow),
            ConnectionState::Idle | ConnectionState::Closed => ("disconnected", Color::Red),
        };
        Line::from(vec![
            Span::styled(format!(" {label} "), Style::default().fg(color)),
            Span::raw(format!(" session {} ", self.status.epoch)),
            Span::styled(
                " ctrl-r reconnect  esc quit",
                Style::default().add_modifier(Modifier::DIM),
            ),
        ])
    }

    /// Draw the view into the whole frame.
    pub fn render(&self, frame: &mut Frame<'_>) {
        let [transcript, status, input] = Layout::vertical([
            Constraint::Min(1),
            Constraint::Length(1),
            Constraint::Length(3),
        ])
        .areas(frame.area());

        let lines: Vec<Line<'_>> = self
            .lines
            .iter()
            .map(|line| {
                let (prefix, style) = match line.author {
                    Author::User => ("you", Style::default().fg(Color::Cyan)),
                    Author::Assistant => ("bot", Style::default().fg(Color::Magenta)),
                    Author::System => ("***", Style::default().add_modifier(Modifier::DIM)),
                    Author::Alert => ("!!!", Style::default().fg(Color::Red)),
                };
                Line::from(vec![
                    Span::styled(format!("{prefix} "), style),
                    Span::raw(line.text.as_str()),
                ])
            })
            .collect();

        // Keep the newest lines in view.
        let height = usize::from(transcript.height.saturating_sub(2));
        let scroll = u16::try_from(lines.len().saturating_sub(height)).unwrap_or(u16::MAX);

        frame.render_widget(
            Paragraph::new(lines)
                .block(Block::bordered().title(self.title.as_str()))
                .wrap(Wrap { trim: false })
                .scroll((scroll, 0)),
            transcript,
        );
        frame.render_widget(Paragraph::new(self.status_line()), status);
        frame.render_widget(
            Paragraph::new(self.input.as_str()).block(Block::bordered().title("message")),
            input,
        );
    }
}

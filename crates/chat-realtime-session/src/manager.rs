//! Connection manager: one room's connection lifecycle as a state machine.
//!
//! The manager owns the current [`Session`], the backpressure flag, the
//! dispatcher and the stream coalescer. It performs no I/O waits itself:
//! transports report events that are fed to [`ConnectionManager::handle_event`],
//! and timers are driven by the owner (see [`crate::client::RoomClient`]).

use std::{collections::HashMap, sync::Arc, time::Duration};

use chat_realtime_core::{
    ConnectionState, Connector, EnvelopeCodec, Epoch, EpochEvent, Frame, MsgStore, Notification,
    NotificationKind, OutboundMessage, RoomContext, SessionConfig, SessionEvent, SessionStatus,
    StreamCoalescer, TransportEvent,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    dispatcher::{Dispatch, Dispatcher, FeatureHandler},
    gate::{self, Backpressure, GateDecision, SendOutcome, SendPath},
    session::Session,
};

/// Page/tab visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Foreground.
    Visible,
    /// Background.
    Hidden,
}

/// Result of a reconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// A new connection was started.
    Started,
    /// The current connection is live and the request was not forced.
    AlreadyLive,
    /// The connector refused to start a connection.
    Failed,
}

/// Connection manager for one room.
pub struct ConnectionManager {
    room: RoomContext,
    config: SessionConfig,
    codec: EnvelopeCodec,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<EpochEvent>,
    session: Option<Session>,
    last_epoch: Epoch,
    gate: Backpressure,
    dispatcher: Dispatcher,
    coalescer: StreamCoalescer,
    store: Arc<MsgStore>,
    status: watch::Sender<SessionStatus>,
    keepalive_running: bool,
}

impl ConnectionManager {
    /// Create a manager for a room.
    ///
    /// Returns the manager and the receiver on which transports report
    /// events; feed them back through [`Self::handle_event`].
    #[must_use]
    pub fn new(
        room: RoomContext,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<EpochEvent>) {
        let codec = EnvelopeCodec::new().with_max_decompressed_bytes(config.max_decompressed_bytes);
        Self::with_codec(room, config, connector, codec)
    }

    /// Create a manager with a custom codec.
    #[must_use]
    pub fn with_codec(
        room: RoomContext,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        codec: EnvelopeCodec,
    ) -> (Self, mpsc::UnboundedReceiver<EpochEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::default());
        let manager = Self {
            coalescer: StreamCoalescer::new(config.flush_delay()),
            store: Arc::new(MsgStore::with_history_limit(config.history_limit)),
            room,
            config,
            codec,
            connector,
            events,
            session: None,
            last_epoch: 0,
            gate: Backpressure::new(),
            dispatcher: Dispatcher::new(),
            status,
            keepalive_running: false,
        };
        (manager, events_rx)
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Room addressing.
    #[must_use]
    pub const fn room(&self) -> &RoomContext {
        &self.room
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Event store.
    #[must_use]
    pub fn store(&self) -> Arc<MsgStore> {
        Arc::clone(&self.store)
    }

    /// Subscribe to status snapshots.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Current status snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            waiting: self.gate.is_set(),
            access_id_assigned: self
                .session
                .as_ref()
                .is_some_and(|s| !s.access_id().is_empty()),
            epoch: self.current_epoch(),
        }
    }

    /// State of the current session, `Idle` if there is none.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Idle, Session::state)
    }

    /// Epoch of the current session, 0 if there is none.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.session.as_ref().map_or(0, Session::epoch)
    }

    /// Access id of the current session.
    #[must_use]
    pub fn access_id(&self) -> &str {
        self.session.as_ref().map_or("", Session::access_id)
    }

    /// Whether a caller request is outstanding.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.gate.is_set()
    }

    /// Whether the keepalive timer should be running.
    #[must_use]
    pub const fn keepalive_running(&self) -> bool {
        self.keepalive_running
    }

    /// Keepalive interval.
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        self.config.keepalive_interval()
    }

    /// Pending stream flush deadline.
    #[must_use]
    pub const fn flush_deadline(&self) -> Option<Instant> {
        self.coalescer.flush_deadline()
    }

    /// Register the feature handler, replacing any previous one.
    pub fn set_handler(&mut self, handler: Box<dyn FeatureHandler>) {
        self.dispatcher.register(handler);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Mount: connect and start the keepalive.
    pub fn start(&mut self) {
        self.connect();
        self.start_keepalive();
    }

    /// Open a new connection, closing any live one first.
    pub fn connect(&mut self) -> ReconnectOutcome {
        if let Some(mut old) = self.session.take() {
            if old.close() {
                tracing::debug!(epoch = old.epoch(), "closed previous connection");
            }
        }

        self.last_epoch += 1;
        let epoch = self.last_epoch;
        let url = self.room.url();

        let outcome = match self.connector.connect(&url, epoch, self.events.clone()) {
            Ok(connection) => {
                tracing::info!(epoch, %url, "connecting");
                self.session = Some(Session::new(epoch, connection));
                self.store
                    .push(SessionEvent::State(ConnectionState::Connecting));
                ReconnectOutcome::Started
            }
            Err(e) => {
                tracing::warn!(epoch, %url, "connect failed: {e}");
                self.notify(NotificationKind::ConnectionError, e.to_string());
                ReconnectOutcome::Failed
            }
        };
        self.publish_status();
        outcome
    }

    /// Reconnect.
    ///
    /// Without a session this is a plain connect. A live session is left
    /// alone unless `forced`, in which case it is closed and replaced.
    pub fn reconnect(&mut self, forced: bool) -> ReconnectOutcome {
        let Some(session) = self.session.as_mut() else {
            return self.connect();
        };

        if session.state().is_live() && !forced {
            return ReconnectOutcome::AlreadyLive;
        }

        session.close();
        if session.set_state(ConnectionState::Reconnecting) {
            self.store
                .push(SessionEvent::State(ConnectionState::Reconnecting));
        }
        tracing::info!(epoch = session.epoch(), forced, "reconnecting");
        self.notify(NotificationKind::Reconnecting, "reconnecting automatically");
        self.gate.release();
        self.connect()
    }

    /// Close the connection and stop the keepalive.
    pub fn close_all(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.close() {
                session.set_state(ConnectionState::Closed);
                self.store.push(SessionEvent::State(ConnectionState::Closed));
            }
        }
        self.stop_keepalive();
        self.publish_status();
    }

    /// Page/tab unload: tear down if the connection is live.
    pub fn unload(&mut self) {
        if self.state().is_live() {
            self.close_all();
        }
    }

    /// Visibility change.
    ///
    /// Hidden tears down; visible forces a reconnect, attempts an immediate
    /// ping and restarts the keepalive if it is not running.
    pub fn set_visibility(&mut self, visibility: Visibility) {
        match visibility {
            Visibility::Hidden => self.close_all(),
            Visibility::Visible => {
                self.reconnect(true);
                self.keepalive_tick();
                if !self.keepalive_running {
                    self.start_keepalive();
                }
            }
        }
    }

    /// Unmount: close, cancel every timer and drop the feature handler.
    pub fn shutdown(&mut self) {
        self.close_all();
        self.coalescer.cancel();
        self.dispatcher.unregister();
        tracing::debug!("session shut down");
    }

    /// Start the keepalive.
    pub fn start_keepalive(&mut self) {
        self.keepalive_running = true;
    }

    /// Stop the keepalive.
    pub fn stop_keepalive(&mut self) {
        self.keepalive_running = false;
    }

    /// Keepalive timer fired: ping if the current session is open.
    ///
    /// Returns whether a ping was sent. The ping is written to the open
    /// connection directly instead of going through [`Self::send_system`], so
    /// a tick on a closed session never takes the reconnect branch.
    pub fn keepalive_tick(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state() != ConnectionState::Open {
            tracing::trace!(state = %session.state(), "skipping ping");
            return false;
        }

        let ping = OutboundMessage::ping(session.access_id());
        let frame = match self.codec.encode(&ping, None) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("failed to encode ping: {e}");
                return false;
            }
        };
        match session.send(frame) {
            Ok(()) => {
                tracing::trace!(epoch = session.epoch(), "ping");
                true
            }
            Err(e) => {
                tracing::warn!(epoch = session.epoch(), "ping failed: {e}");
                false
            }
        }
    }

    /// Flush timer fired: publish buffered stream text.
    ///
    /// Returns the number of updates published.
    pub fn flush(&mut self) -> usize {
        let updates = self.coalescer.flush();
        let count = updates.len();
        for update in updates {
            self.store.push_text(update);
        }
        count
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Caller send through the backpressure gate, default quality.
    pub fn send(&mut self, command: &str, payload: HashMap<String, String>) -> SendOutcome {
        let quality = self.config.compression_quality;
        self.send_via(SendPath::Caller, command, payload, quality)
    }

    /// Caller send with an explicit compression quality.
    pub fn send_with_quality(
        &mut self,
        command: &str,
        payload: HashMap<String, String>,
        quality: Option<u32>,
    ) -> SendOutcome {
        self.send_via(SendPath::Caller, command, payload, quality)
    }

    /// System send: never checks or sets the backpressure flag.
    pub fn send_system(&mut self, command: &str, payload: HashMap<String, String>) -> SendOutcome {
        let quality = self.config.system_compression_quality;
        self.send_via(SendPath::System, command, payload, quality)
    }

    /// Caller send bound to a specific session epoch.
    ///
    /// Dropped with [`SendOutcome::Stale`] if that session is no longer
    /// current.
    pub fn send_on(
        &mut self,
        epoch: Epoch,
        command: &str,
        payload: HashMap<String, String>,
    ) -> SendOutcome {
        if epoch != self.current_epoch() {
            tracing::debug!(epoch, current = self.current_epoch(), %command, "dropping send for stale session");
            return SendOutcome::Stale;
        }
        self.send(command, payload)
    }

    /// Clear the backpressure flag from outside a feature handler.
    pub fn release(&mut self) {
        if self.gate.release() {
            self.publish_status();
        }
    }

    fn send_via(
        &mut self,
        path: SendPath,
        command: &str,
        payload: HashMap<String, String>,
        quality: Option<u32>,
    ) -> SendOutcome {
        let decision = gate::admit(
            self.session.as_ref().map(Session::state),
            self.gate.is_set(),
            path,
        );

        match decision {
            GateDecision::Busy => {
                tracing::trace!(%command, "request in flight, ignoring send");
                SendOutcome::Busy
            }
            GateDecision::Wait => {
                tracing::trace!(%command, "still connecting, ignoring send");
                SendOutcome::Pending
            }
            GateDecision::Reconnect => {
                tracing::debug!(%command, "no open connection, reconnecting");
                self.reconnect(false);
                SendOutcome::Reconnecting
            }
            GateDecision::Admit => self.transmit(path, command, payload, quality),
        }
    }

    fn transmit(
        &mut self,
        path: SendPath,
        command: &str,
        payload: HashMap<String, String>,
        quality: Option<u32>,
    ) -> SendOutcome {
        let Some(session) = self.session.as_mut() else {
            return SendOutcome::Reconnecting;
        };
        let gated = path == SendPath::Caller;
        if gated {
            self.gate.acquire();
        }

        let msg = OutboundMessage::new(command, payload, session.access_id());
        let result = self
            .codec
            .encode(&msg, quality)
            .map_err(|e| e.to_string())
            .and_then(|frame: Frame| session.send(frame).map_err(|e| e.to_string()));

        let outcome = match result {
            Ok(()) => {
                tracing::debug!(epoch = session.epoch(), %command, ?path, "sent");
                SendOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(epoch = session.epoch(), %command, "send failed: {e}");
                if gated {
                    self.gate.release();
                }
                self.notify(NotificationKind::ConnectionError, e.clone());
                SendOutcome::Failed(e)
            }
        };
        self.publish_status();
        outcome
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Apply a transport event. Events from stale sessions are ignored.
    pub fn handle_event(&mut self, event: EpochEvent) {
        let current = self.current_epoch();
        if event.epoch != current {
            tracing::trace!(epoch = event.epoch, current, "ignoring event from stale session");
            return;
        }

        match event.event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Frame(frame) => self.on_frame(&frame),
            TransportEvent::Error(e) => self.on_error(&e),
            TransportEvent::Close { code, reason } => self.on_close(code, &reason),
        }
        self.publish_status();
    }

    fn on_open(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.set_state(ConnectionState::Open) {
            self.store.push(SessionEvent::State(ConnectionState::Open));
        }
        tracing::info!(epoch = session.epoch(), "connected");
        self.gate.release();
        self.notify(NotificationKind::Connected, "connected");
    }

    fn on_frame(&mut self, frame: &Frame) {
        let msg = match self.codec.decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(bytes = frame.len(), binary = frame.is_binary(), "failed to decode frame: {e}");
                self.gate.release();
                self.notify(NotificationKind::DecodeError, e.to_string());
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let dispatch = self.dispatcher.dispatch(
            msg,
            session,
            &mut self.gate,
            &mut self.coalescer,
            &self.store,
        );

        if dispatch == Dispatch::ForcedClose && session.set_state(ConnectionState::Closed) {
            self.store.push(SessionEvent::State(ConnectionState::Closed));
        }
    }

    fn on_error(&mut self, error: &str) {
        tracing::warn!(epoch = self.current_epoch(), "transport error: {error}");
        self.notify(NotificationKind::ConnectionError, error);
        if let Some(session) = self.session.as_mut() {
            if session.close() {
                session.set_state(ConnectionState::Closed);
                self.store.push(SessionEvent::State(ConnectionState::Closed));
            }
        }
    }

    fn on_close(&mut self, code: Option<u16>, reason: &str) {
        if let Some(session) = self.session.as_mut() {
            if session.set_state(ConnectionState::Closed) {
                self.store.push(SessionEvent::State(ConnectionState::Closed));
            }
        }
        tracing::info!(epoch = self.current_epoch(), ?code, reason, "disconnected");
        self.gate.release();
        self.notify(NotificationKind::Disconnected, "disconnected");
    }

    fn notify(&self, kind: NotificationKind, detail: impl Into<String>) {
        self.store.push_notice(Notification::new(kind, detail));
    }

    fn publish_status(&self) {
        let next = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

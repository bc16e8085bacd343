//! Async driver for a [`ConnectionManager`].
//!
//! [`RoomClient::spawn`] moves the manager into a single task that
//! serializes transport events, the keepalive interval, the stream flush
//! deadline and caller commands. The returned handle is cheap to clone;
//! dropping every handle shuts the session down.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chat_realtime_core::{
    ConnectionState, Connector, Epoch, EpochEvent, MsgStore, RoomContext, SessionConfig,
    SessionEvent, SessionStatus,
};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    dispatcher::FeatureHandler,
    gate::{SendOutcome, SendPath},
    manager::{ConnectionManager, Visibility},
};

/// Client handle errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session driver stopped")]
    Stopped,
}

enum Command {
    Send {
        path: SendPath,
        command: String,
        payload: HashMap<String, String>,
        quality: Option<Option<u32>>,
        epoch: Option<Epoch>,
        reply: oneshot::Sender<SendOutcome>,
    },
    Reconnect(bool),
    Visibility(Visibility),
    Unload,
    Release,
    SetHandler(Box<dyn FeatureHandler>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running room session.
#[derive(Clone)]
pub struct RoomClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    store: Arc<MsgStore>,
}

impl RoomClient {
    /// Build a manager for `room` and start driving it.
    ///
    /// The connection is opened and the keepalive started as soon as the
    /// driver task runs.
    #[must_use]
    pub fn spawn(
        room: RoomContext,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, JoinHandle<()>) {
        let (manager, events) = ConnectionManager::new(room, config, connector);
        Self::spawn_manager(manager, events)
    }

    /// Start driving an existing manager.
    #[must_use]
    pub fn spawn_manager(
        manager: ConnectionManager,
        events: mpsc::UnboundedReceiver<EpochEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let client = Self {
            commands,
            status: manager.status(),
            store: manager.store(),
        };
        let task = tokio::spawn(drive(manager, events, commands_rx));
        (client, task)
    }

    /// Subscribe to status snapshots.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Event store.
    #[must_use]
    pub fn store(&self) -> Arc<MsgStore> {
        Arc::clone(&self.store)
    }

    /// History followed by live events.
    #[must_use]
    pub fn events(&self) -> BoxStream<'static, SessionEvent> {
        self.store.history_plus_stream()
    }

    /// Wait until the connection reaches `state`.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver exits first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    /// Caller send through the backpressure gate.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub async fn send(
        &self,
        command: impl Into<String>,
        payload: HashMap<String, String>,
    ) -> Result<SendOutcome, ClientError> {
        self.request(SendPath::Caller, command.into(), payload, None, None)
            .await
    }

    /// Caller send with an explicit compression quality (`None` for text).
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub async fn send_with_quality(
        &self,
        command: impl Into<String>,
        payload: HashMap<String, String>,
        quality: Option<u32>,
    ) -> Result<SendOutcome, ClientError> {
        self.request(SendPath::Caller, command.into(), payload, Some(quality), None)
            .await
    }

    /// Caller send bound to the session `epoch`.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub async fn send_on(
        &self,
        epoch: Epoch,
        command: impl Into<String>,
        payload: HashMap<String, String>,
    ) -> Result<SendOutcome, ClientError> {
        self.request(SendPath::Caller, command.into(), payload, None, Some(epoch))
            .await
    }

    /// System send, bypassing the backpressure flag.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub async fn send_system(
        &self,
        command: impl Into<String>,
        payload: HashMap<String, String>,
    ) -> Result<SendOutcome, ClientError> {
        self.request(SendPath::System, command.into(), payload, None, None)
            .await
    }

    /// Request a reconnect.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub fn reconnect(&self, forced: bool) -> Result<(), ClientError> {
        self.command(Command::Reconnect(forced))
    }

    /// Report a visibility change.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub fn set_visibility(&self, visibility: Visibility) -> Result<(), ClientError> {
        self.command(Command::Visibility(visibility))
    }

    /// Report a page unload.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub fn unload(&self) -> Result<(), ClientError> {
        self.command(Command::Unload)
    }

    /// Clear the backpressure flag.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub fn release(&self) -> Result<(), ClientError> {
        self.command(Command::Release)
    }

    /// Register the feature handler.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver has exited.
    pub fn set_handler(&self, handler: Box<dyn FeatureHandler>) -> Result<(), ClientError> {
        self.command(Command::SetHandler(handler))
    }

    /// Close the connection, cancel timers and stop the driver.
    ///
    /// # Errors
    /// Returns [`ClientError::Stopped`] if the driver had already exited.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Shutdown(reply))?;
        done.await.map_err(|_| ClientError::Stopped)
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Stopped)
    }

    async fn request(
        &self,
        path: SendPath,
        command: String,
        payload: HashMap<String, String>,
        quality: Option<Option<u32>>,
        epoch: Option<Epoch>,
    ) -> Result<SendOutcome, ClientError> {
        let (reply, outcome) = oneshot::channel();
        self.command(Command::Send {
            path,
            command,
            payload,
            quality,
            epoch,
            reply,
        })?;
        outcome.await.map_err(|_| ClientError::Stopped)
    }
}

async fn drive(
    mut manager: ConnectionManager,
    mut events: mpsc::UnboundedReceiver<EpochEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    manager.start();

    let period = manager.keepalive_interval().max(Duration::from_millis(1));
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive_was_running = manager.keepalive_running();

    loop {
        let flush_at = manager.flush_deadline();

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::debug!("all client handles dropped");
                    manager.shutdown();
                    break;
                };
                if let Some(done) = apply(&mut manager, command) {
                    let _ = done.send(());
                    break;
                }
            }
            Some(event) = events.recv() => manager.handle_event(event),
            _ = keepalive.tick(), if manager.keepalive_running() => {
                manager.keepalive_tick();
            }
            () = time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                manager.flush();
            }
        }

        // A restarted keepalive waits a full period before its first ping.
        let running = manager.keepalive_running();
        if running && !keepalive_was_running {
            keepalive.reset();
        }
        keepalive_was_running = running;
    }

    tracing::debug!(room = %manager.room().room_id, "session driver stopped");
}

/// Apply one command. Returns the shutdown reply when the driver should stop.
fn apply(manager: &mut ConnectionManager, command: Command) -> Option<oneshot::Sender<()>> {
    match command {
        Command::Send {
            path,
            command,
            payload,
            quality,
            epoch,
            reply,
        } => {
            let outcome = match (path, epoch, quality) {
                (SendPath::System, ..) => manager.send_system(&command, payload),
                (SendPath::Caller, Some(epoch), _) => manager.send_on(epoch, &command, payload),
                (SendPath::Caller, None, Some(quality)) => {
                    manager.send_with_quality(&command, payload, quality)
                }
                (SendPath::Caller, None, None) => manager.send(&command, payload),
            };
            let _ = reply.send(outcome);
        }
        Command::Reconnect(forced) => {
            manager.reconnect(forced);
        }
        Command::Visibility(visibility) => manager.set_visibility(visibility),
        Command::Unload => manager.unload(),
        Command::Release => manager.release(),
        Command::SetHandler(handler) => manager.set_handler(handler),
        Command::Shutdown(reply) => {
            manager.shutdown();
            return Some(reply);
        }
    }
    None
}

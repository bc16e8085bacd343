//! WebSocket transport over tokio-tungstenite.
//!
//! Each [`Connector::connect`] spawns one task that owns the socket. The
//! returned [`Connection`] handle queues frames to that task over a channel
//! and reads the shared ready state; the task reports lifecycle events on the
//! session's event sink. `Close` is always the last event a task reports.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use chat_realtime_core::{
    Connection, Connector, CredentialProvider, Epoch, EpochEvent, EventSink, Frame, ReadyState,
    TransportError, TransportEvent,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

const fn decode_state(raw: u8) -> ReadyState {
    match raw {
        CONNECTING => ReadyState::Connecting,
        OPEN => ReadyState::Open,
        CLOSING => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

enum Outgoing {
    Frame(Frame),
    Close,
}

/// Opens WebSocket connections.
#[derive(Clone)]
pub struct WebSocketConnector {
    credentials: Option<Arc<dyn CredentialProvider>>,
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    /// Anonymous connector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Authorize connections with a bearer credential from `provider`.
    #[must_use]
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &str,
        epoch: Epoch,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let state = Arc::new(AtomicU8::new(CONNECTING));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let task = SocketTask {
            epoch,
            events,
            state: Arc::clone(&state),
            credentials: self.credentials.clone(),
            connect_timeout: self.connect_timeout,
        };
        runtime.spawn(task.run(request, outgoing_rx));

        Ok(Box::new(WebSocketConnection { outgoing, state }))
    }
}

/// Handle to one WebSocket.
///
/// Dropping the handle closes the socket.
struct WebSocketConnection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    state: Arc<AtomicU8>,
}

impl Connection for WebSocketConnection {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match self.ready_state() {
            ReadyState::Open => self
                .outgoing
                .send(Outgoing::Frame(frame))
                .map_err(|_| TransportError::Closed),
            ReadyState::Connecting => Err(TransportError::NotOpen),
            ReadyState::Closing | ReadyState::Closed => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) {
        let live = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s == CONNECTING || s == OPEN).then_some(CLOSING)
            })
            .is_ok();
        if live {
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }

    fn ready_state(&self) -> ReadyState {
        decode_state(self.state.load(Ordering::Acquire))
    }
}

struct SocketTask {
    epoch: Epoch,
    events: EventSink,
    state: Arc<AtomicU8>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    connect_timeout: Duration,
}

impl SocketTask {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(EpochEvent {
            epoch: self.epoch,
            event,
        });
    }

    fn fail(&self, error: String) {
        tracing::warn!(epoch = self.epoch, "websocket connect failed: {error}");
        self.state.store(CLOSED, Ordering::Release);
        self.emit(TransportEvent::Error(error.clone()));
        self.emit(TransportEvent::Close {
            code: None,
            reason: error,
        });
    }

    async fn authorize(&self, mut request: Request) -> Result<Request, String> {
        let Some(provider) = &self.credentials else {
            return Ok(request);
        };
        let Some(token) = provider.credential().await.map_err(|e| e.to_string())? else {
            return Ok(request);
        };
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| format!("invalid credential: {e}"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }

    async fn run(self, request: Request, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let uri = request.uri().to_string();

        let request = match self.authorize(request).await {
            Ok(request) => request,
            Err(e) => return self.fail(e),
        };

        let connected = tokio::select! {
            result = tokio::time::timeout(self.connect_timeout, connect_async(request)) => result,
            _ = outgoing.recv() => {
                tracing::debug!(epoch = self.epoch, "closed before open");
                self.state.store(CLOSED, Ordering::Release);
                self.emit(TransportEvent::Close {
                    code: None,
                    reason: "closed before open".into(),
                });
                return;
            }
        };

        let stream = match connected {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return self.fail(e.to_string()),
            Err(_) => {
                return self.fail(format!(
                    "timed out after {}ms",
                    self.connect_timeout.as_millis()
                ));
            }
        };

        self.state.store(OPEN, Ordering::Release);
        tracing::info!(epoch = self.epoch, %uri, "websocket connected");
        self.emit(TransportEvent::Open);

        let (mut sink, mut source) = stream.split();
        let mut code = None;
        let mut reason = String::new();

        loop {
            tokio::select! {
                command = outgoing.recv() => match command {
                    Some(Outgoing::Frame(frame)) => {
                        let message = match frame {
                            Frame::Text(text) => Message::text(text),
                            Frame::Binary(bytes) => Message::binary(bytes),
                        };
                        if let Err(e) = sink.send(message).await {
                            self.emit(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        self.state.store(CLOSING, Ordering::Release);
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        reason = "closed by client".into();
                        break;
                    }
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(TransportEvent::Frame(Frame::Text(text.as_str().to_owned())));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.emit(TransportEvent::Frame(Frame::Binary(bytes.to_vec())));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            code = Some(u16::from(frame.code));
                            reason = frame.reason.as_str().to_owned();
                        }
                        tracing::debug!(epoch = self.epoch, ?code, "close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(epoch = self.epoch, "websocket read error: {e}");
                        self.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }

        self.state.store(CLOSED, Ordering::Release);
        self.emit(TransportEvent::Close { code, reason });
        tracing::debug!(epoch = self.epoch, "websocket task ended");
    }
}

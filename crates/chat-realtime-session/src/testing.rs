//! In-memory transport for tests.

use std::sync::{Arc, Mutex};

use chat_realtime_core::{
    Connection, Connector, Epoch, EpochEvent, EventSink, Frame, InboundMessage, ReadyState,
    TransportError, TransportEvent,
};

/// One recorded physical connection.
#[derive(Clone)]
pub struct MockLink {
    pub epoch: Epoch,
    pub url: String,
    pub sink: EventSink,
    pub frames: Arc<Mutex<Vec<Frame>>>,
    pub state: Arc<Mutex<ReadyState>>,
}

impl MockLink {
    /// Frames sent on this connection.
    pub fn sent(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    /// Commands of the text frames sent on this connection.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|f| match f {
                Frame::Text(t) => serde_json::from_str::<serde_json::Value>(t)
                    .ok()
                    .and_then(|v| v["cmd"].as_str().map(str::to_string)),
                Frame::Binary(_) => Some("<binary>".to_string()),
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            *self.state.lock().unwrap(),
            ReadyState::Closing | ReadyState::Closed
        )
    }

    pub fn event(&self, event: TransportEvent) -> EpochEvent {
        EpochEvent {
            epoch: self.epoch,
            event,
        }
    }

    pub fn open(&self) -> EpochEvent {
        *self.state.lock().unwrap() = ReadyState::Open;
        self.event(TransportEvent::Open)
    }

    pub fn close_event(&self) -> EpochEvent {
        *self.state.lock().unwrap() = ReadyState::Closed;
        self.event(TransportEvent::Close {
            code: None,
            reason: String::new(),
        })
    }

    pub fn text(&self, msg: &InboundMessage) -> EpochEvent {
        self.event(TransportEvent::Frame(Frame::Text(
            serde_json::to_string(msg).unwrap(),
        )))
    }

    /// Push an event through the transport channel, as a real transport would.
    pub fn emit(&self, event: TransportEvent) {
        if matches!(event, TransportEvent::Open) {
            *self.state.lock().unwrap() = ReadyState::Open;
        }
        let _ = self.sink.send(self.event(event));
    }

    pub fn emit_message(&self, msg: &InboundMessage) {
        self.emit(TransportEvent::Frame(Frame::Text(
            serde_json::to_string(msg).unwrap(),
        )));
    }
}

struct MockConnection {
    link: MockLink,
}

impl Connection for MockConnection {
    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match *self.link.state.lock().unwrap() {
            ReadyState::Open => {
                self.link.frames.lock().unwrap().push(frame);
                Ok(())
            }
            ReadyState::Connecting => Err(TransportError::NotOpen),
            ReadyState::Closing | ReadyState::Closed => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) {
        let mut state = self.link.state.lock().unwrap();
        if matches!(*state, ReadyState::Connecting | ReadyState::Open) {
            *state = ReadyState::Closing;
        }
    }

    fn ready_state(&self) -> ReadyState {
        *self.link.state.lock().unwrap()
    }
}

/// Connector that records every connection it opens.
#[derive(Clone, Default)]
pub struct MockConnector {
    links: Arc<Mutex<Vec<MockLink>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn links(&self) -> Vec<MockLink> {
        self.links.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn last(&self) -> MockLink {
        self.links.lock().unwrap().last().cloned().unwrap()
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        url: &str,
        epoch: Epoch,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        if *self.fail.lock().unwrap() {
            return Err(TransportError::Connect("refused".into()));
        }
        let link = MockLink {
            epoch,
            url: url.to_string(),
            sink: events,
            frames: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(Mutex::new(ReadyState::Connecting)),
        };
        self.links.lock().unwrap().push(link.clone());
        Ok(Box::new(MockConnection { link }))
    }
}

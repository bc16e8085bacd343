#![cfg(feature = "websocket")]

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use chat_realtime_core::{
    Brotli, Compression, ConnectionState, Connector, CredentialProvider, EpochEvent, Frame,
    ReadyState, RoomContext, SessionConfig, SessionEvent, TransportEvent, UpdateMode,
    traits::StaticCredential,
};
use chat_realtime_session::{RoomClient, SendOutcome, StreamingTextHandler};
use chat_realtime_transport::WebSocketConnector;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_test::assert_ok;
use tokio_tungstenite::{
    WebSocketStream, accept_async, accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

const WAIT: Duration = Duration::from_secs(5);

async fn serve_once<F, Fut>(handler: F) -> SocketAddr
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        handler(ws).await;
    });
    addr
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<EpochEvent>) -> TransportEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
        .event
}

#[tokio::test]
async fn test_frames_flow_both_ways_until_server_close() {
    let addr = serve_once(|mut ws| async move {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected text frame");
        };
        ws.send(Message::text(text.as_str().to_owned())).await.unwrap();
        ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    })
    .await;

    let (events, mut rx) = mpsc::unbounded_channel();
    let mut connection = WebSocketConnector::new()
        .connect(&format!("ws://{addr}/ws/llmchat/room/r1"), 1, events)
        .unwrap();
    assert_eq!(connection.ready_state(), ReadyState::Connecting);

    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
    assert_eq!(connection.ready_state(), ReadyState::Open);

    assert_ok!(connection.send(Frame::Text(r#"{"cmd":"ping"}"#.into())));
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Frame(Frame::Text(r#"{"cmd":"ping"}"#.into()))
    );
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Frame(Frame::Binary(vec![1, 2, 3]))
    );
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Close {
            code: Some(1000),
            reason: "bye".into()
        }
    );
    assert_eq!(connection.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_bearer_credential_is_sent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (header_tx, header_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let header = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let _ = header_tx.send(header);
            Ok(response)
        };
        let _ws = accept_hdr_async(stream, callback).await.unwrap();
        tokio::time::sleep(WAIT).await;
    });

    let provider: Arc<dyn CredentialProvider> = Arc::new(StaticCredential("secret".into()));
    let (events, mut rx) = mpsc::unbounded_channel();
    let _connection = WebSocketConnector::new()
        .with_credentials(provider)
        .connect(&format!("ws://{addr}/ws"), 1, events)
        .unwrap();

    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
    let header = timeout(WAIT, header_rx).await.unwrap().unwrap();
    assert_eq!(header.as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_refused_connection_reports_error_then_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (events, mut rx) = mpsc::unbounded_channel();
    let connection = WebSocketConnector::new()
        .connect(&format!("ws://{addr}/ws"), 3, events)
        .unwrap();

    assert!(matches!(next_event(&mut rx).await, TransportEvent::Error(_)));
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Close { code: None, .. }
    ));
    assert_eq!(connection.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_client_close_sends_close_frame() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let addr = serve_once(|mut ws| async move {
        let mut closed = false;
        while let Some(message) = ws.next().await {
            if matches!(message, Ok(Message::Close(_))) {
                closed = true;
                break;
            }
        }
        let _ = seen_tx.send(closed);
    })
    .await;

    let (events, mut rx) = mpsc::unbounded_channel();
    let mut connection = WebSocketConnector::new()
        .connect(&format!("ws://{addr}/ws"), 1, events)
        .unwrap();
    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);

    connection.close();
    assert_eq!(connection.ready_state(), ReadyState::Closing);
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Close { .. }
    ));
    assert!(timeout(WAIT, seen_rx).await.unwrap().unwrap());

    // Idempotent.
    connection.close();
    assert!(connection.send(Frame::Text("{}".into())).is_err());
}

#[tokio::test]
async fn test_room_session_over_websocket() {
    let (request_tx, request_rx) = oneshot::channel();
    let addr = serve_once(|mut ws| async move {
        let assign = json!({"cmd": "SetUserAccessId", "status": 200, "ok": true, "data": {"access_id": "u-1"}});
        ws.send(Message::text(assign.to_string())).await.unwrap();

        // Skip keepalive pings; the caller request is compressed.
        let request = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => break bytes.to_vec(),
                Some(Ok(_)) => {}
                _ => return,
            }
        };
        let _ = request_tx.send(request);

        for fragment in ["Hel", "lo"] {
            let msg = json!({"cmd": "SendUserMessage", "ok": true, "data": {"messageId": "m1", "llmResponse": fragment}});
            ws.send(Message::text(msg.to_string())).await.unwrap();
        }
        let done = json!({"cmd": "isStreamingComplete", "ok": true, "data": {"messageId": "m1", "llmResponse": "Hello, world!"}});
        ws.send(Message::text(done.to_string())).await.unwrap();

        while ws.next().await.is_some() {}
    })
    .await;

    let (client, _task) = RoomClient::spawn(
        RoomContext::new(format!("http://{addr}"), "r1"),
        SessionConfig::default(),
        Arc::new(WebSocketConnector::new()),
    );
    assert_ok!(client.set_handler(Box::new(StreamingTextHandler::new())));
    let mut events = client.events();

    let mut status = client.status();
    timeout(
        WAIT,
        status.wait_for(|s| s.state == ConnectionState::Open && s.access_id_assigned),
    )
    .await
    .unwrap()
    .unwrap();

    let mut payload = HashMap::new();
    payload.insert("message".to_string(), "hi".to_string());
    let outcome = client.send("SendUserMessage", payload).await.unwrap();
    assert_eq!(outcome, SendOutcome::Sent);

    let request = timeout(WAIT, request_rx).await.unwrap().unwrap();
    let raw = Brotli.decompress(&request, 1 << 20).unwrap();
    let json: Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["cmd"], "SendUserMessage");
    assert_eq!(json["data"]["message"], "hi");
    assert_eq!(json["request_user_access_id"], "u-1");

    let final_text = timeout(WAIT, async {
        while let Some(event) = events.next().await {
            if let SessionEvent::Text(update) = event {
                if update.mode == UpdateMode::Replace {
                    return update.text;
                }
            }
        }
        String::new()
    })
    .await
    .unwrap();
    assert_eq!(final_text, "Hello, world!");

    timeout(WAIT, status.wait_for(|s| !s.waiting))
        .await
        .unwrap()
        .unwrap();

    assert_ok!(client.shutdown().await);
}

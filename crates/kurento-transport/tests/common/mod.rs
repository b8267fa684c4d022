//! In-process WebSocket peer standing in for the media server.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Await `fut`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out waiting")
}

/// Poll `check` until it holds, failing the test after [`TIMEOUT`].
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Listener that accepts exactly one WebSocket client.
pub struct MockServer {
    pub url: String,
    peer: oneshot::Receiver<MockPeer>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        let _accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut path = String::new();
            let mut origin = None;
            let mut config = WebSocketConfig::default();
            config.max_message_size = None;
            config.max_frame_size = None;
            let ws = tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    path = req.uri().path().to_owned();
                    origin = req
                        .headers()
                        .get("origin")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    Ok(resp)
                },
                Some(config),
            )
            .await
            .unwrap();
            let _ = tx.send(MockPeer { ws, path, origin });
        });

        Self {
            url: format!("ws://{addr}"),
            peer: rx,
        }
    }

    /// Wait for the client's handshake to complete.
    pub async fn accept(self) -> MockPeer {
        within(self.peer).await.unwrap()
    }
}

/// Server side of one accepted connection.
pub struct MockPeer {
    ws: WebSocketStream<TcpStream>,
    /// Request path of the handshake.
    pub path: String,
    /// `Origin` header of the handshake.
    pub origin: Option<String>,
}

impl MockPeer {
    /// Next JSON request from the client.
    pub async fn recv(&mut self) -> Value {
        loop {
            let msg = within(self.ws.next())
                .await
                .expect("client went away")
                .expect("read failed");
            match msg {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame from client: {other:?}"),
            }
        }
    }

    /// Receive `n` requests.
    pub async fn recv_many(&mut self, n: usize) -> Vec<Value> {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(self.recv().await);
        }
        frames
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .unwrap();
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_binary(&mut self, frame: Value) {
        self.ws
            .send(Message::Binary(frame.to_string().into_bytes().into()))
            .await
            .unwrap();
    }

    /// Successful reply to request `id`.
    pub async fn reply(&mut self, id: u64, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    /// Error reply to request `id`.
    pub async fn reply_error(&mut self, id: u64, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message, "data": {"type": "MEDIA_OBJECT_NOT_FOUND"}}
        }))
        .await;
    }

    /// Push an `onEvent` notification carrying `seq` in its data.
    pub async fn event(&mut self, event_type: &str, source: &str, seq: u64) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "onEvent",
            "params": {
                "value": {
                    "data": {"source": source, "type": event_type, "seq": seq},
                    "object": source,
                    "type": event_type
                }
            }
        }))
        .await;
    }

    /// Send a close frame.
    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Wait until the client closes the socket.
    pub async fn expect_close(&mut self) {
        loop {
            match within(self.ws.next()).await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    }
}

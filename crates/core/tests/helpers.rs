use std::time::Duration;

use leash_core::{
    error::{LeashError, LeashResult},
    transport::{Transport, TransportFrame, TransportReceiver, TransportSender},
    types::{LeashConfig, NotificationPolicy, WsEvent, channel},
};
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, oneshot},
    time::{timeout, timeout_at},
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// What the engine pushed into the socket, as observed by the test server.
#[derive(Debug)]
pub enum Sent {
    Text(String),
    Ping,
    Pong,
    Close,
}

pub struct MockSender {
    tx: mpsc::UnboundedSender<Sent>,
}

impl TransportSender for MockSender {
    async fn send_text(&mut self, text: String) -> LeashResult<()> {
        self.tx
            .send(Sent::Text(text))
            .map_err(|_| LeashError::transport("sink closed"))
    }

    async fn send_ping(&mut self) -> LeashResult<()> {
        self.tx
            .send(Sent::Ping)
            .map_err(|_| LeashError::transport("sink closed"))
    }

    async fn send_pong(&mut self, _payload: Vec<u8>) -> LeashResult<()> {
        self.tx
            .send(Sent::Pong)
            .map_err(|_| LeashError::transport("sink closed"))
    }

    async fn close(&mut self) {
        let _ = self.tx.send(Sent::Close);
    }
}

pub struct MockReceiver {
    rx: mpsc::UnboundedReceiver<LeashResult<TransportFrame>>,
}

impl TransportReceiver for MockReceiver {
    async fn recv(&mut self) -> Option<LeashResult<TransportFrame>> {
        self.rx.recv().await
    }
}

type ConnectReply = oneshot::Sender<LeashResult<(MockSender, MockReceiver)>>;

/// In-memory stand-in for the WebSocket endpoint: every connection attempt
/// made by the engine shows up at the harness, which accepts or refuses it.
pub struct MockTransport {
    connects_tx: mpsc::UnboundedSender<ConnectReply>,
}

impl Transport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    async fn connect(&self, _url: &str) -> LeashResult<(MockSender, MockReceiver)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.connects_tx
            .send(reply_tx)
            .map_err(|_| LeashError::transport("harness gone"))?;
        reply_rx
            .await
            .map_err(|_| LeashError::transport("harness dropped the attempt"))?
    }
}

pub struct ServerHarness {
    connects_rx: mpsc::UnboundedReceiver<ConnectReply>,
}

impl ServerHarness {
    pub fn transport() -> (MockTransport, ServerHarness) {
        let (connects_tx, connects_rx) = mpsc::unbounded_channel();
        (MockTransport { connects_tx }, ServerHarness { connects_rx })
    }

    pub async fn accept(&mut self) -> ServerConn {
        let reply = timeout(RECV_TIMEOUT, self.connects_rx.recv())
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("transport dropped");
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let _ = reply.send(Ok((MockSender { tx: sent_tx }, MockReceiver { rx: frames_rx })));
        ServerConn {
            sent_rx,
            frames_tx: Some(frames_tx),
        }
    }

    pub async fn refuse(&mut self) {
        let reply = timeout(RECV_TIMEOUT, self.connects_rx.recv())
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("transport dropped");
        let _ = reply.send(Err(LeashError::transport("connection refused")));
    }
}

/// The server end of one accepted connection.
pub struct ServerConn {
    sent_rx: mpsc::UnboundedReceiver<Sent>,
    frames_tx: Option<mpsc::UnboundedSender<LeashResult<TransportFrame>>>,
}

impl ServerConn {
    /// Next JSON-RPC request sent by the engine, skipping keepalive frames.
    pub async fn next_request(&mut self) -> Value {
        loop {
            let sent = timeout(RECV_TIMEOUT, self.sent_rx.recv())
                .await
                .expect("timed out waiting for a request")
                .expect("engine dropped the connection");
            match sent {
                Sent::Text(text) => {
                    return serde_json::from_str(&text).expect("engine sent invalid JSON");
                }
                Sent::Ping | Sent::Pong => continue,
                Sent::Close => panic!("engine closed while a request was expected"),
            }
        }
    }

    /// Like `next_request`, but returns `None` when nothing arrives within
    /// `wait` (for asserting that no request was sent).
    pub async fn try_next_request(&mut self, wait: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let sent = match timeout_at(deadline, self.sent_rx.recv()).await {
                Ok(Some(sent)) => sent,
                Ok(None) => return None,
                Err(_) => return None,
            };
            match sent {
                Sent::Text(text) => {
                    return Some(serde_json::from_str(&text).expect("engine sent invalid JSON"));
                }
                Sent::Ping | Sent::Pong | Sent::Close => continue,
            }
        }
    }

    pub fn send_json(&self, value: Value) {
        if let Some(frames_tx) = &self.frames_tx {
            let _ = frames_tx.send(Ok(TransportFrame::Text(value.to_string())));
        }
    }

    pub fn ack(&self, id: u64, wire_id: u64) {
        self.send_json(json!({ "jsonrpc": "2.0", "result": wire_id, "id": id }));
    }

    pub fn reject(&self, id: u64, code: i64, message: &str) {
        self.send_json(json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": id,
        }));
    }

    pub fn notify(&self, method: &str, subscription: u64, payload: Value) {
        self.send_json(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": { "subscription": subscription, "result": payload },
        }));
    }

    /// Simulate the socket dropping out from under the engine.
    pub fn drop_connection(&mut self) {
        self.frames_tx = None;
    }
}

pub fn test_config() -> LeashConfig {
    LeashConfig {
        ws_url: "ws://leash-test".to_string(),
        ping_interval_ms: 60_000,
        min_backoff_ms: 1,
        max_backoff_ms: 5,
        max_reconnect_attempts: 3,
        event_buffer: 256,
        bundle_window_ms: 10,
        bundle_max_batch: 64,
        poll_interval_ms: 25,
        policy: NotificationPolicy {
            sample_window_ms: 100,
            backpressure_window_ms: 200,
            ..NotificationPolicy::default()
        },
    }
}

/// Blocking-recv the next event without stalling the async runtime.
pub async fn next_event(events_rx: &channel::Receiver<WsEvent>) -> WsEvent {
    let events_rx = events_rx.clone();
    tokio::task::spawn_blocking(move || {
        events_rx
            .recv_timeout(RECV_TIMEOUT)
            .expect("timed out waiting for an event")
    })
    .await
    .expect("event reader panicked")
}

/// Drain events until one matches, panicking on timeout.
pub async fn wait_for(
    events_rx: &channel::Receiver<WsEvent>,
    matches: impl Fn(&WsEvent) -> bool,
) -> WsEvent {
    loop {
        let event = next_event(events_rx).await;
        if matches(&event) {
            return event;
        }
    }
}

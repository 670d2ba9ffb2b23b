use std::future::Future;

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::error::{LeashError, LeashResult};

/// A frame as seen by the supervisor. Binary frames and raw protocol frames
/// never occur on the Solana pubsub wire and are filtered out below this
/// boundary.
#[derive(Debug)]
pub enum TransportFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Close,
}

/// Write half of one live connection. Owned exclusively by the supervisor
/// runloop, which funnels every send through it.
pub trait TransportSender: Send + 'static {
    fn send_text(&mut self, text: String) -> impl Future<Output = LeashResult<()>> + Send;

    fn send_ping(&mut self) -> impl Future<Output = LeashResult<()>> + Send;

    fn send_pong(&mut self, payload: Vec<u8>) -> impl Future<Output = LeashResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Read half of one live connection, owned by the per-epoch reader task.
pub trait TransportReceiver: Send + 'static {
    /// `None` means the peer closed the stream.
    fn recv(&mut self) -> impl Future<Output = Option<LeashResult<TransportFrame>>> + Send;
}

/// Connection factory. Injected into the client so tests can drive the
/// engine through an in-memory transport.
pub trait Transport: Send + Sync + 'static {
    type Sender: TransportSender;
    type Receiver: TransportReceiver;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = LeashResult<(Self::Sender, Self::Receiver)>> + Send;
}

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The production transport: `tokio-tungstenite` over TCP/TLS.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteTransport;

pub struct TungsteniteSender {
    sink: SplitSink<TungsteniteStream, Message>,
}

pub struct TungsteniteReceiver {
    stream: SplitStream<TungsteniteStream>,
}

impl Transport for TungsteniteTransport {
    type Sender = TungsteniteSender;
    type Receiver = TungsteniteReceiver;

    async fn connect(&self, url: &str) -> LeashResult<(TungsteniteSender, TungsteniteReceiver)> {
        let (ws, _response) = connect_async(url).await.map_err(LeashError::transport)?;
        let (sink, stream) = ws.split();
        Ok((TungsteniteSender { sink }, TungsteniteReceiver { stream }))
    }
}

impl TransportSender for TungsteniteSender {
    async fn send_text(&mut self, text: String) -> LeashResult<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(LeashError::transport)
    }

    async fn send_ping(&mut self) -> LeashResult<()> {
        self.sink
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(LeashError::transport)
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> LeashResult<()> {
        self.sink
            .send(Message::Pong(payload.into()))
            .await
            .map_err(LeashError::transport)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

impl TransportReceiver for TungsteniteReceiver {
    async fn recv(&mut self) -> Option<LeashResult<TransportFrame>> {
        loop {
            return match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    Some(Ok(TransportFrame::Text(text.as_str().to_string())))
                }
                Ok(Message::Ping(payload)) => Some(Ok(TransportFrame::Ping(payload.to_vec()))),
                Ok(Message::Pong(_)) => Some(Ok(TransportFrame::Pong)),
                Ok(Message::Close(_)) => Some(Ok(TransportFrame::Close)),
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {
                    warn!("ignoring unexpected non-text frame");
                    continue;
                }
                Err(e) => Some(Err(LeashError::transport(e))),
            };
        }
    }
}

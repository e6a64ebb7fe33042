//! Frame transport for the gateway session
//!
//! `Connector` opens a connection and hands back its two halves. The session
//! only sees text frames; the WebSocket details stay here.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Error, Result};

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a keep-alive ping
    async fn ping(&mut self) -> Result<()>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, `None` once the connection has closed
    async fn next_text(&mut self) -> Option<Result<String>>;
}

/// Opens connections to the gateway
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish one connection
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for the gateway
pub struct WsConnector {
    url: String,
    token: Option<SecretString>,
    timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub const fn new(url: String, token: Option<SecretString>) -> Self {
        Self {
            url,
            token,
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Connect(format!("invalid gateway url {}: {e}", self.url)))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| Error::Config(format!("invalid gateway token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| Error::Connect(format!("timed out connecting to {}", self.url)))?
                .map_err(|e| Error::Connect(format!("{}: {e}", self.url)))?;

        tracing::debug!(url = %self.url, "websocket connected");

        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsFrames { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<()> {
        self.sink
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(?frame, "gateway closed connection");
                    return None;
                }
                Ok(WsMessage::Binary(data)) => {
                    tracing::debug!(len = data.len(), "ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => return Some(Err(Error::Connect(e.to_string()))),
            }
        }
    }
}

/// In-memory connector
///
/// Each `connect` call pops the next scripted outcome. A successful outcome
/// yields a `PeerHandle` on `peers()` so the caller can play the gateway side.
pub struct MemoryConnector {
    outcomes: std::sync::Mutex<std::collections::VecDeque<bool>>,
    peers: mpsc::UnboundedSender<PeerHandle>,
}

/// Gateway side of an in-memory connection
pub struct PeerHandle {
    /// Frames the bridge wrote
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the bridge; drop to close the connection
    pub to_client: mpsc::UnboundedSender<String>,
}

impl MemoryConnector {
    /// Create a connector; `outcomes` lists which connect attempts succeed.
    /// Attempts beyond the list succeed.
    #[must_use]
    pub fn new(outcomes: Vec<bool>) -> (Self, mpsc::UnboundedReceiver<PeerHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                peers: tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let succeed = self
            .outcomes
            .lock()
            .map_err(|_| Error::Connect("connector poisoned".into()))?
            .pop_front()
            .unwrap_or(true);
        if !succeed {
            return Err(Error::Connect("connection refused".into()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        self.peers
            .send(PeerHandle {
                from_client: client_rx,
                to_client: peer_tx,
            })
            .map_err(|_| Error::Connect("no peer listening".into()))?;

        Ok((
            Box::new(MemorySink { tx: Some(client_tx) }),
            Box::new(MemoryStream { rx: peer_rx }),
        ))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| Error::Send("connection closed".into()))?
            .send(text)
            .map_err(|_| Error::Send("peer gone".into()))
    }

    async fn ping(&mut self) -> Result<()> {
        match &self.tx {
            Some(tx) if !tx.is_closed() => Ok(()),
            _ => Err(Error::Send("peer gone".into())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_text(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

//! WebSocket transport.
//!
//! The socket is split into a writer task fed by an `mpsc` channel and a
//! reader task that forwards data messages to the dispatcher. Everything
//! above this module sees only [`Transport`] channels, which lets tests swap
//! the socket for an in-memory [`Connector`].

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::negotiate::{websocket_url, Negotiator};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};
use url::Url;
use wsmux_protocol::{Capabilities, ControlFrame, EncodedFrames, Encoder, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An item for the writer task.
#[derive(Debug)]
pub enum Outgoing {
    Frame(WireMessage),
    /// Send a WebSocket close and stop writing.
    Close,
}

/// Channel pair for one open connection.
#[derive(Debug)]
pub struct Transport {
    pub tx: mpsc::Sender<Outgoing>,
    pub rx: mpsc::Receiver<WireMessage>,
}

/// Negotiates with a server and opens the connection to it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn negotiate(&self) -> Result<Capabilities, ClientError>;

    async fn open(&self, caps: &Capabilities) -> Result<Transport, ClientError>;
}

/// Connector backed by reqwest and tokio-tungstenite.
pub struct WebSocketConnector {
    negotiator: Negotiator,
    ws_url: Url,
    config: ClientConfig,
}

impl WebSocketConnector {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let base = config.server_url()?;
        let ws_url = websocket_url(&base)?;
        let negotiator = Negotiator::new(base, config.connect_timeout(), &config.user_agent)?;

        Ok(Self {
            negotiator,
            ws_url,
            config,
        })
    }

    pub fn websocket_url(&self) -> &Url {
        &self.ws_url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn negotiate(&self) -> Result<Capabilities, ClientError> {
        self.negotiator.negotiate().await
    }

    async fn open(&self, caps: &Capabilities) -> Result<Transport, ClientError> {
        debug!(
            url = %self.ws_url,
            server = %caps.project.name,
            version = %caps.project.version,
            "opening WebSocket"
        );

        let (stream, _) = tokio::time::timeout(
            self.config.connect_timeout(),
            connect_async(self.ws_url.as_str()),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::WebSocket(e.to_string()))?;

        let (sink, source) = stream.split();
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue);
        let (in_tx, in_rx) = mpsc::channel(self.config.outbound_queue);

        tokio::spawn(writer_task(sink, out_rx));
        tokio::spawn(reader_task(source, in_tx));

        Ok(Transport {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

async fn writer_task(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(item) = rx.recv().await {
        let message = match item {
            Outgoing::Frame(WireMessage::Text(text)) => Message::Text(text),
            Outgoing::Frame(WireMessage::Binary(data)) => Message::Binary(data.to_vec()),
            Outgoing::Close => {
                debug!("closing WebSocket");
                break;
            }
        };

        if let Err(e) = sink.send(message).await {
            error!(error = %e, "WebSocket send failed");
            break;
        }
    }

    let _ = sink.close().await;
    debug!("writer task ended");
}

async fn reader_task(mut source: SplitStream<WsStream>, tx: mpsc::Sender<WireMessage>) {
    while let Some(result) = source.next().await {
        let message = match result {
            Ok(Message::Text(text)) => WireMessage::Text(text),
            Ok(Message::Binary(data)) => WireMessage::Binary(Bytes::from(data)),
            Ok(Message::Close(frame)) => {
                debug!(?frame, "server closed the WebSocket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
        };

        trace!(len = message.len(), text = message.is_text(), "received");
        if tx.send(message).await.is_err() {
            break;
        }
    }

    debug!("reader task ended");
}

/// Shared handle for queueing frames to the writer task.
///
/// A logical send (a control frame plus its chunks) holds the send lock for
/// its whole duration, so its frames reach the socket contiguously and in
/// index order.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Outgoing>,
    send_lock: Arc<Mutex<()>>,
    max_in_message_size: usize,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Outgoing>, max_in_message_size: usize) -> Self {
        Self {
            tx,
            send_lock: Arc::new(Mutex::new(())),
            max_in_message_size,
        }
    }

    /// Queues a control frame and its chunks.
    pub async fn send_frames(&self, frames: EncodedFrames) -> Result<(), ClientError> {
        let size = frames.control.len();
        if size > self.max_in_message_size {
            return Err(ClientError::MessageTooLarge {
                size,
                max: self.max_in_message_size,
            });
        }

        let _guard = self.send_lock.lock().await;
        for message in frames.into_messages() {
            self.tx
                .send(Outgoing::Frame(message))
                .await
                .map_err(|_| ClientError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Queues a lone control frame.
    pub async fn send_control(&self, frame: &ControlFrame) -> Result<(), ClientError> {
        let control = Encoder::encode_control(frame)?;
        self.send_frames(EncodedFrames {
            control,
            chunks: Vec::new(),
        })
        .await
    }

    /// Asks the writer task to close the socket once queued frames are out.
    pub async fn close(&self) {
        let _guard = self.send_lock.lock().await;
        let _ = self.tx.send(Outgoing::Close).await;
    }

    /// Non-blocking variant of [`Outbound::close`] for use in `Drop`.
    pub fn try_close(&self) {
        let _ = self.tx.try_send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

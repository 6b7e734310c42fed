//! WebSocket tunnels.
//!
//! A tunnel is a remote WebSocket the server holds open on the client's
//! behalf. Each tunnel message travels as a `message` control frame declaring
//! its length and kind, followed by chunk frames keyed by the tunnel id and
//! indexed from 0. A sender finishes one message before starting the next, so
//! at most one message per tunnel is ever in assembly.

use crate::error::ClientError;
use crate::transport::Outbound;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use wsmux_protocol::frame::usable_payload;
use wsmux_protocol::{
    Capabilities, ChunkFrame, CloseFrame, ControlFrame, CorrelationId, Encoder, ErrorFrame,
    MessageFrame, MessageKind, OpenFrame, CLOSE_ABNORMAL, MAX_CHUNKS,
};

/// Something received on a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    Text(String),
    Binary(Bytes),
    /// The tunnel was closed. Nothing follows.
    Close { code: u16, reason: String },
    /// The server reported a failure on this tunnel.
    Error {
        code: String,
        key: String,
        message: String,
    },
}

pub(crate) type OpenResult = Result<(OpenFrame, mpsc::Receiver<TunnelMessage>), ClientError>;

struct Assembly {
    kind: MessageKind,
    length: usize,
    slots: Vec<Option<Bytes>>,
    received: usize,
}

impl Assembly {
    fn new(kind: MessageKind, length: usize, chunks: usize) -> Self {
        Self {
            kind,
            length,
            slots: vec![None; chunks],
            received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn into_message(self) -> Result<TunnelMessage, String> {
        let mut payload = BytesMut::with_capacity(self.length);
        for part in self.slots.iter().flatten() {
            payload.extend_from_slice(part);
        }
        if payload.len() != self.length {
            return Err(format!(
                "message declared {} bytes but carried {}",
                self.length,
                payload.len()
            ));
        }
        to_message(self.kind, payload.freeze())
    }
}

fn to_message(kind: MessageKind, payload: Bytes) -> Result<TunnelMessage, String> {
    match kind {
        MessageKind::Binary => Ok(TunnelMessage::Binary(payload)),
        MessageKind::Text => String::from_utf8(payload.to_vec())
            .map(TunnelMessage::Text)
            .map_err(|_| "text message is not valid UTF-8".to_string()),
    }
}

struct OpenTunnel {
    tx: mpsc::Sender<TunnelMessage>,
    assembly: Option<Assembly>,
}

#[derive(Default)]
struct Registry {
    connecting: HashMap<CorrelationId, oneshot::Sender<OpenResult>>,
    open: HashMap<CorrelationId, OpenTunnel>,
    closed: bool,
}

impl Registry {
    /// Hands a message to the tunnel's receiver without blocking.
    ///
    /// A receiver that has fallen a full buffer behind loses its tunnel: the
    /// entry is removed, so `recv` ends after the buffered messages, and
    /// `TunnelOverflow` tells the caller to close it on the server.
    fn deliver(&mut self, id: CorrelationId, message: TunnelMessage) -> Result<(), ClientError> {
        let Some(tunnel) = self.open.get(&id) else {
            return Ok(());
        };
        match tunnel.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%id, "tunnel buffer full, closing tunnel");
                self.open.remove(&id);
                Err(ClientError::TunnelOverflow(id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%id, "tunnel handle dropped");
                self.open.remove(&id);
                Ok(())
            }
        }
    }
}

/// Tracks tunnels being opened and tunnels that are open.
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<Mutex<Registry>>,
    usable: usize,
    buffer: usize,
}

impl TunnelRegistry {
    pub fn new(max_packet_size: usize, buffer: usize) -> Result<Self, ClientError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            usable: usable_payload(max_packet_size)?,
            buffer: buffer.max(1),
        })
    }

    /// Registers a pending `connect`. Fails with `ConnectionClosed` once
    /// [`fail_all`](Self::fail_all) has run.
    pub(crate) fn register_connect(
        &self,
        id: CorrelationId,
    ) -> Result<oneshot::Receiver<OpenResult>, ClientError> {
        let mut registry = self.inner.lock();
        if registry.closed {
            return Err(ClientError::ConnectionClosed);
        }
        if registry.connecting.contains_key(&id) || registry.open.contains_key(&id) {
            tracing::error!(%id, "tunnel id already in use");
            return Err(ClientError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        registry.connecting.insert(id, tx);
        Ok(rx)
    }

    /// Forgets a pending `connect` the caller gave up on.
    pub fn cancel_connect(&self, id: CorrelationId) -> bool {
        self.inner.lock().connecting.remove(&id).is_some()
    }

    /// Fails a pending `connect` with `err`. Returns whether one was waiting.
    pub fn fail_connect(&self, id: CorrelationId, err: ClientError) -> bool {
        let Some(waiter) = self.inner.lock().connecting.remove(&id) else {
            return false;
        };
        debug!(%id, error = %err, "connect failed");
        let _ = waiter.send(Err(err));
        true
    }

    /// Completes a pending `connect`.
    ///
    /// Fails when nobody is waiting for this id any more; the caller should
    /// then close the tunnel on the server.
    pub fn on_open(&self, frame: OpenFrame) -> Result<(), ClientError> {
        let id = frame.id;
        let (waiter, rx) = {
            let mut registry = self.inner.lock();
            let waiter = registry
                .connecting
                .remove(&id)
                .ok_or(ClientError::UnknownCorrelation(id))?;
            let (tx, rx) = mpsc::channel(self.buffer);
            registry.open.insert(id, OpenTunnel { tx, assembly: None });
            (waiter, rx)
        };

        debug!(%id, protocol = %frame.protocol, "tunnel open");
        if waiter.send(Ok((frame, rx))).is_err() {
            self.inner.lock().open.remove(&id);
            return Err(ClientError::TunnelClosed);
        }
        Ok(())
    }

    /// Starts assembling a message. Empty messages are delivered at once.
    pub fn on_message(&self, frame: MessageFrame) -> Result<(), ClientError> {
        let id = frame.id;
        let mut registry = self.inner.lock();
        let tunnel = registry
            .open
            .get_mut(&id)
            .ok_or(ClientError::UnknownCorrelation(id))?;

        if tunnel.assembly.is_some() {
            return Err(ClientError::MalformedFrame(format!(
                "message on tunnel {} started before the previous one completed",
                id
            )));
        }

        let chunks = frame.length.div_ceil(self.usable);
        if chunks > MAX_CHUNKS {
            return Err(ClientError::MalformedFrame(format!(
                "message of {} bytes cannot be chunked",
                frame.length
            )));
        }

        if chunks == 0 {
            let message = to_message(frame.kind, Bytes::new()).map_err(ClientError::MalformedFrame)?;
            return registry.deliver(id, message);
        }

        tunnel.assembly = Some(Assembly::new(frame.kind, frame.length, chunks));
        Ok(())
    }

    /// Stores one chunk of the message in assembly.
    pub fn on_chunk(&self, chunk: ChunkFrame) -> Result<(), ClientError> {
        let id = chunk.id;
        let mut registry = self.inner.lock();
        let tunnel = registry
            .open
            .get_mut(&id)
            .ok_or(ClientError::UnknownCorrelation(id))?;

        let Some(assembly) = tunnel.assembly.as_mut() else {
            return Err(ClientError::MalformedFrame(format!(
                "chunk on tunnel {} without a message frame",
                id
            )));
        };

        let expected = assembly.slots.len();
        let Some(slot) = assembly.slots.get_mut(chunk.index as usize) else {
            return Err(ClientError::IndexOutOfRange {
                id,
                index: chunk.index,
                expected,
            });
        };
        if slot.is_none() {
            *slot = Some(chunk.payload);
            assembly.received += 1;
        } else {
            trace!(%id, index = chunk.index, "duplicate tunnel chunk ignored");
        }

        if !assembly.is_complete() {
            return Ok(());
        }

        let Some(assembly) = tunnel.assembly.take() else {
            return Ok(());
        };
        let message = assembly
            .into_message()
            .map_err(ClientError::MalformedFrame)?;
        registry.deliver(id, message)
    }

    /// Handles a close from the server.
    pub fn on_close(&self, frame: CloseFrame) -> Result<(), ClientError> {
        let id = frame.id;
        let mut registry = self.inner.lock();

        if let Some(waiter) = registry.connecting.remove(&id) {
            drop(registry);
            debug!(%id, code = frame.code, "tunnel closed before opening");
            let _ = waiter.send(Err(ClientError::TunnelClosed));
            return Ok(());
        }

        if !registry.open.contains_key(&id) {
            return Err(ClientError::UnknownCorrelation(id));
        }
        debug!(%id, code = frame.code, reason = %frame.reason, "tunnel closed by server");
        // The tunnel goes away either way; a full buffer only loses the close.
        let _ = registry.deliver(
            id,
            TunnelMessage::Close {
                code: frame.code,
                reason: frame.reason,
            },
        );
        registry.open.remove(&id);
        Ok(())
    }

    /// Routes an error frame to a tunnel or a pending `connect`.
    pub fn on_error(&self, id: CorrelationId, frame: &ErrorFrame) -> Result<(), ClientError> {
        let mut registry = self.inner.lock();

        if let Some(waiter) = registry.connecting.remove(&id) {
            drop(registry);
            let _ = waiter.send(Err(ClientError::Remote {
                code: frame.code.clone(),
                key: frame.key.clone(),
                message: frame.message.clone(),
            }));
            return Ok(());
        }

        if !registry.open.contains_key(&id) {
            return Err(ClientError::UnknownCorrelation(id));
        }
        registry.deliver(
            id,
            TunnelMessage::Error {
                code: frame.code.clone(),
                key: frame.key.clone(),
                message: frame.message.clone(),
            },
        )
    }

    /// Closes an open tunnel locally, delivering `code` to its handle.
    pub fn fail(&self, id: CorrelationId, code: u16, reason: &str) -> bool {
        let mut registry = self.inner.lock();
        if !registry.open.contains_key(&id) {
            return false;
        }
        let _ = registry.deliver(
            id,
            TunnelMessage::Close {
                code,
                reason: reason.to_string(),
            },
        );
        registry.open.remove(&id);
        true
    }

    /// Tears down every tunnel and pending `connect` and refuses new ones.
    /// Returns how many there were.
    pub fn fail_all(&self) -> usize {
        let (connecting, open) = {
            let mut registry = self.inner.lock();
            registry.closed = true;
            (
                std::mem::take(&mut registry.connecting),
                std::mem::take(&mut registry.open),
            )
        };

        let count = connecting.len() + open.len();
        for (_, waiter) in connecting {
            let _ = waiter.send(Err(ClientError::ConnectionClosed));
        }
        for (_, tunnel) in open {
            let _ = tunnel.tx.try_send(TunnelMessage::Close {
                code: CLOSE_ABNORMAL,
                reason: "connection closed".to_string(),
            });
        }
        count
    }

    /// Returns whether `id` is an open tunnel.
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.inner.lock().open.contains_key(&id)
    }

    /// Forgets an open tunnel. Returns whether it was present.
    pub fn remove(&self, id: CorrelationId) -> bool {
        self.inner.lock().open.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        let registry = self.inner.lock();
        registry.connecting.len() + registry.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open tunnel.
///
/// Dropping the handle without [`Tunnel::close`] leaves the remote socket
/// open until the server or the connection closes it.
pub struct Tunnel {
    id: CorrelationId,
    protocol: String,
    rx: mpsc::Receiver<TunnelMessage>,
    outbound: Outbound,
    registry: TunnelRegistry,
    max_packet_size: usize,
    max_body_size: usize,
}

impl Tunnel {
    pub(crate) fn new(
        open: OpenFrame,
        rx: mpsc::Receiver<TunnelMessage>,
        outbound: Outbound,
        registry: TunnelRegistry,
        caps: &Capabilities,
    ) -> Self {
        Self {
            id: open.id,
            protocol: open.protocol,
            rx,
            outbound,
            registry,
            max_packet_size: caps.max_packet_size,
            max_body_size: caps.max_body_size,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Sub-protocol chosen by the remote endpoint, empty if none.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(MessageKind::Text, Bytes::from(text.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send(MessageKind::Binary, data.into()).await
    }

    async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), ClientError> {
        if !self.registry.contains(self.id) {
            return Err(ClientError::TunnelClosed);
        }
        if payload.len() > self.max_body_size {
            return Err(ClientError::BodyTooLarge {
                size: payload.len(),
                max: self.max_body_size,
            });
        }

        let frames = Encoder::encode_message(self.id, kind, payload, self.max_packet_size)?;
        self.outbound.send_frames(frames).await
    }

    /// Receives the next message. Returns `None` once the tunnel is gone.
    pub async fn recv(&mut self) -> Option<TunnelMessage> {
        self.rx.recv().await
    }

    /// Closes the tunnel. A tunnel the server already closed is left alone.
    pub async fn close(self, code: u16, reason: impl Into<String>) -> Result<(), ClientError> {
        if !self.registry.remove(self.id) {
            return Ok(());
        }
        debug!(id = %self.id, code, "closing tunnel");
        self.outbound
            .send_control(&ControlFrame::Close(CloseFrame {
                id: self.id,
                code,
                reason: reason.into(),
            }))
            .await
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .finish()
    }
}

//! In-memory connector for unit tests.
//!
//! [`MockConnector`] hands the multiplexer one side of a channel pair; the
//! test drives the other side through [`Peer`], playing the server.

use crate::error::ClientError;
use crate::transport::{Connector, Outgoing, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use wsmux_protocol::{
    Capabilities, ChunkFrame, ControlFrame, CorrelationId, Decoder, Encoder, Inbound, Maintainer,
    MessageKind, Project, RequestFrame, ResponseFrame, WireMessage, PROTOCOL_VERSION,
};

pub(crate) fn capabilities(max_packet_size: usize) -> Capabilities {
    Capabilities {
        versions: vec![PROTOCOL_VERSION],
        request_timeout_secs: 30,
        max_body_size: 1 << 20,
        max_in_message_size: 64 * 1024,
        max_packet_size,
        maintainer: Some(Maintainer {
            email: Some("ops@relay.test".into()),
            website: None,
        }),
        project: Project {
            name: "mock-relay".into(),
            version: "0.0.0".into(),
            ..Default::default()
        },
    }
}

pub(crate) struct MockConnector {
    caps: Capabilities,
    transport: Mutex<Option<Transport>>,
    negotiations: AtomicUsize,
    opens: AtomicUsize,
    failures_left: AtomicUsize,
    negotiate_delay: Duration,
}

impl MockConnector {
    pub(crate) fn new(caps: Capabilities) -> (Self, Peer) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(256);
        let peer = Peer {
            rx: out_rx,
            tx: Some(in_tx),
            max_packet_size: caps.max_packet_size,
        };
        let connector = Self {
            caps,
            transport: Mutex::new(Some(Transport {
                tx: out_tx,
                rx: in_rx,
            })),
            negotiations: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            negotiate_delay: Duration::ZERO,
        };
        (connector, peer)
    }

    pub(crate) fn with_negotiate_delay(mut self, delay: Duration) -> Self {
        self.negotiate_delay = delay;
        self
    }

    /// Makes the first `count` negotiations fail.
    pub(crate) fn with_failed_negotiations(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn negotiations(&self) -> usize {
        self.negotiations.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn negotiate(&self) -> Result<Capabilities, ClientError> {
        self.negotiations.fetch_add(1, Ordering::SeqCst);
        if !self.negotiate_delay.is_zero() {
            tokio::time::sleep(self.negotiate_delay).await;
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ClientError::Negotiation("scripted failure".into()));
        }
        Ok(self.caps.clone())
    }

    async fn open(&self, _caps: &Capabilities) -> Result<Transport, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.transport
            .lock()
            .take()
            .ok_or_else(|| ClientError::WebSocket("mock transport already opened".into()))
    }
}

/// The server side of a [`MockConnector`].
pub(crate) struct Peer {
    rx: mpsc::Receiver<Outgoing>,
    tx: Option<mpsc::Sender<WireMessage>>,
    max_packet_size: usize,
}

impl Peer {
    pub(crate) fn try_next(&mut self) -> Option<Outgoing> {
        self.rx.try_recv().ok()
    }

    pub(crate) async fn next_message(&mut self) -> WireMessage {
        match self.rx.recv().await {
            Some(Outgoing::Frame(message)) => message,
            Some(Outgoing::Close) => panic!("client closed the connection"),
            None => panic!("client hung up"),
        }
    }

    pub(crate) async fn next_is_close(&mut self) -> bool {
        matches!(self.rx.recv().await, Some(Outgoing::Close))
    }

    pub(crate) async fn next_control(&mut self) -> ControlFrame {
        match Decoder::decode(self.next_message().await).unwrap() {
            Inbound::Control(frame) => frame,
            other => panic!("expected control frame, got {:?}", other),
        }
    }

    pub(crate) async fn next_chunk(&mut self) -> ChunkFrame {
        match Decoder::decode(self.next_message().await).unwrap() {
            Inbound::Chunk(chunk) => chunk,
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    /// Reads a request frame and its body chunks.
    pub(crate) async fn read_request(&mut self) -> (RequestFrame, Bytes) {
        let request = match self.next_control().await {
            ControlFrame::Request(request) => request,
            other => panic!("expected request, got {:?}", other),
        };

        let len = request.body_length.unwrap_or(0);
        let mut body = BytesMut::with_capacity(len);
        let mut index = 0u16;
        while body.len() < len {
            let chunk = self.next_chunk().await;
            assert_eq!(chunk.id, request.id);
            assert_eq!(chunk.index, index);
            body.extend_from_slice(&chunk.payload);
            index += 1;
        }
        (request, body.freeze())
    }

    pub(crate) async fn respond(&self, frame: ResponseFrame, body: Bytes) {
        let frames = Encoder::encode_response(frame, body, self.max_packet_size).unwrap();
        for message in frames.into_messages() {
            self.send(message).await;
        }
    }

    /// Sends one tunnel message, optionally with its chunks reversed.
    pub(crate) async fn send_message(
        &self,
        id: CorrelationId,
        kind: MessageKind,
        payload: Bytes,
        reversed: bool,
    ) {
        let frames = Encoder::encode_message(id, kind, payload, self.max_packet_size).unwrap();
        self.send(WireMessage::Text(frames.control)).await;
        let mut chunks = frames.chunks;
        if reversed {
            chunks.reverse();
        }
        for chunk in chunks {
            self.send(WireMessage::Binary(chunk)).await;
        }
    }

    pub(crate) async fn send_control(&self, frame: ControlFrame) {
        let text = Encoder::encode_control(&frame).unwrap();
        self.send(WireMessage::Text(text)).await;
    }

    pub(crate) async fn send_text(&self, text: String) {
        self.send(WireMessage::Text(text)).await;
    }

    /// Drops the inbound side, as if the socket closed.
    pub(crate) fn disconnect(&mut self) {
        self.tx = None;
    }

    async fn send(&self, message: WireMessage) {
        self.tx
            .as_ref()
            .expect("peer disconnected")
            .send(message)
            .await
            .expect("dispatcher gone");
    }
}

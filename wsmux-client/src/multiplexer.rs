//! Connection multiplexer.
//!
//! Owns the single WebSocket connection for a client. The first operation
//! negotiates capabilities and opens the connection; concurrent callers wait
//! on the same initialization. After that, one dispatch task routes every
//! inbound frame to the pending request table or the tunnel registry.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::{FetchRequest, HttpResponse};
use crate::pending::PendingTable;
use crate::transport::{Connector, Outbound, WebSocketConnector};
use crate::tunnel::{Tunnel, TunnelRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tracing::{debug, info, trace, warn};
use wsmux_protocol::{
    Capabilities, ChunkFrame, CloseFrame, ConnectFrame, ControlFrame, CorrelationId, Decoder,
    Encoder, ErrorFrame, HeaderMap, Inbound, ProtocolError, RequestFrame, WireMessage,
    CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CLOSE_TRY_AGAIN_LATER,
};

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The server sent something this client cannot interpret.
    ProtocolViolation { reason: String },
    /// An error frame that belongs to no request or tunnel.
    RemoteError {
        code: String,
        key: String,
        message: String,
    },
    /// The connection is gone. Every request and tunnel has been failed.
    Closed,
}

/// State that exists once the connection is open.
struct Link {
    caps: Capabilities,
    outbound: Outbound,
    pending: PendingTable,
    tunnels: TunnelRegistry,
}

/// Multiplexes requests and tunnels over one connection.
pub struct Multiplexer {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    link: OnceCell<Link>,
    events: broadcast::Sender<ConnectionEvent>,
    connected: Arc<AtomicBool>,
}

impl Multiplexer {
    /// Creates a multiplexer for the configured server. Nothing is sent
    /// until the first operation.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let connector = WebSocketConnector::new(config.clone())?;
        Ok(Self::with_connector(config, Arc::new(connector)))
    }

    /// Creates a multiplexer that negotiates and connects through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            connector,
            link: OnceCell::new(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn ready(&self) -> Result<&Link, ClientError> {
        let link = self.link.get_or_try_init(|| self.establish()).await?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(link)
    }

    async fn establish(&self) -> Result<Link, ClientError> {
        let caps = self.connector.negotiate().await?;
        let transport = self.connector.open(&caps).await?;

        let pending = PendingTable::new(caps.max_packet_size)?;
        let tunnels = TunnelRegistry::new(caps.max_packet_size, self.config.tunnel_buffer)?;
        let outbound = Outbound::new(transport.tx, caps.max_in_message_size);

        self.connected.store(true, Ordering::SeqCst);
        let dispatcher = Dispatcher {
            pending: pending.clone(),
            tunnels: tunnels.clone(),
            outbound: outbound.clone(),
            events: self.events.clone(),
            connected: self.connected.clone(),
        };
        tokio::spawn(dispatcher.run(transport.rx));

        info!(
            server = %caps.project.name,
            version = %caps.project.version,
            max_packet_size = caps.max_packet_size,
            "connected"
        );

        Ok(Link {
            caps,
            outbound,
            pending,
            tunnels,
        })
    }

    /// Issues one request and waits for its response.
    pub async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, ClientError> {
        let link = self.ready().await?;

        let size = request.body.len();
        if size > link.caps.max_body_size {
            return Err(ClientError::BodyTooLarge {
                size,
                max: link.caps.max_body_size,
            });
        }

        let id = CorrelationId::new();
        let frame = RequestFrame::new(id, request.method.as_str(), request.url.as_str())
            .with_headers(request.headers.clone());
        let frames = Encoder::encode_request(frame, request.body.clone(), link.caps.max_packet_size)?;

        let handle = link
            .pending
            .register(id, &request, link.caps.request_timeout())?;
        let chunks = frames.chunks.len();
        if let Err(e) = link.outbound.send_frames(frames).await {
            link.pending.discard(id);
            return Err(e);
        }
        debug!(%id, method = %request.method, url = %request.url, chunks, "request sent");

        handle.wait().await
    }

    /// Opens a tunnel to a remote WebSocket endpoint.
    pub async fn connect(
        &self,
        url: &str,
        protocols: Vec<String>,
        headers: HeaderMap,
    ) -> Result<Tunnel, ClientError> {
        let link = self.ready().await?;

        let id = CorrelationId::new();
        let opened = link.tunnels.register_connect(id)?;
        let frame = ControlFrame::Connect(ConnectFrame {
            id,
            url: url.to_string(),
            headers,
            protocols,
        });
        if let Err(e) = link.outbound.send_control(&frame).await {
            link.tunnels.cancel_connect(id);
            return Err(e);
        }
        debug!(%id, url, "connect sent");

        let result = match tokio::time::timeout(link.caps.request_timeout(), opened).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                link.tunnels.cancel_connect(id);
                warn!(%id, url, "connect timed out");
                Err(ClientError::Timeout)
            }
        };

        let (open, messages) = result?;
        Ok(Tunnel::new(
            open,
            messages,
            link.outbound.clone(),
            link.tunnels.clone(),
            &link.caps,
        ))
    }

    /// Returns the negotiated capabilities, connecting first if needed.
    pub async fn capabilities(&self) -> Result<Capabilities, ClientError> {
        Ok(self.ready().await?.caps.clone())
    }

    /// Subscribes to connection-level events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Number of requests awaiting completion.
    pub fn pending_count(&self) -> usize {
        self.link.get().map(|link| link.pending.len()).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection, failing everything in flight.
    pub async fn close(&self) -> Result<(), ClientError> {
        let Some(link) = self.link.get() else {
            return Ok(());
        };

        self.connected.store(false, Ordering::SeqCst);
        link.outbound.close().await;
        let requests = link.pending.fail_all(|| ClientError::ConnectionClosed);
        let tunnels = link.tunnels.fail_all();
        debug!(requests, tunnels, "connection closed locally");
        Ok(())
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(link) = self.link.get() {
            link.outbound.try_close();
        }
    }
}

/// Routes inbound frames. Runs on its own task and never blocks on callers.
struct Dispatcher {
    pending: PendingTable,
    tunnels: TunnelRegistry,
    outbound: Outbound,
    events: broadcast::Sender<ConnectionEvent>,
    connected: Arc<AtomicBool>,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::Receiver<WireMessage>) {
        while let Some(message) = rx.recv().await {
            self.dispatch(message);
        }

        self.connected.store(false, Ordering::SeqCst);
        let requests = self.pending.fail_all(|| ClientError::ConnectionClosed);
        let tunnels = self.tunnels.fail_all();
        info!(requests, tunnels, "connection closed");
        self.report(ConnectionEvent::Closed);
    }

    fn dispatch(&self, message: WireMessage) {
        match Decoder::decode(message) {
            Ok(Inbound::Control(frame)) => self.on_control(frame),
            Ok(Inbound::Chunk(chunk)) => self.on_chunk(chunk),
            Err(e) => self.on_violation(e),
        }
    }

    fn on_control(&self, frame: ControlFrame) {
        trace!(kind = frame.kind(), id = ?frame.id(), "control frame");
        match frame {
            ControlFrame::Response(response) => {
                let id = response.id;
                match self.pending.on_response_frame(response) {
                    Ok(()) => {}
                    Err(ClientError::UnknownCorrelation(_)) => {
                        warn!(%id, "response for unknown request");
                    }
                    Err(e) if e.is_invariant_violation() => {}
                    Err(e) => warn!(%id, error = %e, "response failed its request"),
                }
            }
            ControlFrame::Error(error) => self.on_error_frame(error),
            ControlFrame::Open(open) => {
                let id = open.id;
                if let Err(e) = self.tunnels.on_open(open) {
                    debug!(%id, error = %e, "open for abandoned connect");
                    self.send_close(id, CLOSE_NORMAL, "connect abandoned".to_string());
                }
            }
            ControlFrame::Message(message) => {
                let id = message.id;
                if let Err(e) = self.tunnels.on_message(message) {
                    self.on_tunnel_error(id, e);
                }
            }
            ControlFrame::Close(close) => {
                let id = close.id;
                if self.tunnels.on_close(close).is_err() {
                    trace!(%id, "close for unknown tunnel ignored");
                }
            }
            other @ (ControlFrame::Request(_) | ControlFrame::Connect(_)) => {
                let reason = format!("unexpected {} frame from server", other.kind());
                warn!(%reason, "protocol violation");
                self.report(ConnectionEvent::ProtocolViolation { reason });
            }
        }
    }

    fn on_chunk(&self, chunk: ChunkFrame) {
        let id = chunk.id;
        if self.tunnels.contains(id) {
            if let Err(e) = self.tunnels.on_chunk(chunk) {
                self.on_tunnel_error(id, e);
            }
            return;
        }

        match self.pending.on_chunk_frame(chunk) {
            Ok(()) => {}
            Err(ClientError::UnknownCorrelation(_)) => trace!(%id, "stale chunk ignored"),
            Err(e) if e.is_invariant_violation() => {}
            Err(e) => warn!(%id, error = %e, "chunk failed its request"),
        }
    }

    fn on_error_frame(&self, frame: ErrorFrame) {
        if let Some(id) = frame.id {
            if self.pending.on_error(id, &frame).is_ok() {
                return;
            }
            match self.tunnels.on_error(id, &frame) {
                Ok(()) => return,
                Err(ClientError::UnknownCorrelation(_)) => {
                    warn!(%id, code = %frame.code, "error frame for unknown id");
                }
                Err(e) => return self.on_tunnel_error(id, e),
            }
        } else {
            warn!(
                code = %frame.code,
                key = %frame.key,
                message = %frame.message,
                "connection-level error from server"
            );
        }

        self.report(ConnectionEvent::RemoteError {
            code: frame.code,
            key: frame.key,
            message: frame.message,
        });
    }

    fn on_tunnel_error(&self, id: CorrelationId, err: ClientError) {
        match &err {
            ClientError::UnknownCorrelation(_) => {
                trace!(%id, "frame for unknown tunnel ignored");
                return;
            }
            ClientError::TunnelOverflow(_) => {
                // Already removed from the registry; only the server is left.
                self.send_close(id, CLOSE_TRY_AGAIN_LATER, err.to_string());
                return;
            }
            e if e.is_invariant_violation() => tracing::error!(%id, error = %e, "tunnel framing"),
            e => warn!(%id, error = %e, "closing tunnel"),
        }

        let reason = err.to_string();
        self.tunnels.fail(id, CLOSE_PROTOCOL_ERROR, &reason);
        self.send_close(id, CLOSE_PROTOCOL_ERROR, reason);
    }

    /// Handles a frame that failed to decode. The failure terminates the
    /// request or tunnel it names, if any, and is always reported.
    fn on_violation(&self, err: ProtocolError) {
        let reason = err.to_string();

        match err.correlation_id() {
            Some(id) if self.pending.fail(id, ClientError::MalformedFrame(reason.clone())) => {
                warn!(%id, %reason, "malformed frame failed its request");
            }
            Some(id) if self.tunnels.contains(id) => {
                self.on_tunnel_error(id, ClientError::MalformedFrame(reason.clone()));
            }
            Some(id)
                if self
                    .tunnels
                    .fail_connect(id, ClientError::MalformedFrame(reason.clone())) =>
            {
                warn!(%id, %reason, "malformed frame failed its connect");
                self.send_close(id, CLOSE_PROTOCOL_ERROR, reason.clone());
            }
            _ => warn!(%reason, "protocol violation"),
        }

        self.report(ConnectionEvent::ProtocolViolation { reason });
    }

    fn send_close(&self, id: CorrelationId, code: u16, reason: String) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let frame = ControlFrame::Close(CloseFrame { id, code, reason });
            if let Err(e) = outbound.send_control(&frame).await {
                debug!(%id, error = %e, "could not send close");
            }
        });
    }

    fn report(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

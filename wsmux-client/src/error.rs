//! Client error types.

use thiserror::Error;
use wsmux_protocol::CorrelationId;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("capability negotiation failed: {0}")]
    Negotiation(String),

    #[error("body of {size} bytes exceeds the negotiated maximum of {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("control frame of {size} bytes exceeds the negotiated maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("no pending operation for {0}")]
    UnknownCorrelation(CorrelationId),

    #[error("request timeout")]
    Timeout,

    #[error("remote error: {code} ({key}): {message}")]
    Remote {
        code: String,
        key: String,
        message: String,
    },

    #[error("duplicate correlation id {0}")]
    DuplicateId(CorrelationId),

    #[error("chunk index {index} out of range for {id} (expected {expected} chunks)")]
    IndexOutOfRange {
        id: CorrelationId,
        index: u16,
        expected: usize,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("tunnel {0} fell behind and was closed")]
    TunnelOverflow(CorrelationId),

    #[error("HTTP {status} {status_text}")]
    HttpStatus { status: u16, status_text: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] wsmux_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns whether reissuing the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::ConnectionClosed)
    }

    /// Returns whether this error signals a bug in id generation or framing
    /// rather than a runtime condition.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ClientError::DuplicateId(_) | ClientError::IndexOutOfRange { .. }
        )
    }
}

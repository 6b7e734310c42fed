//! JSON control frames and the capability record.

use crate::error::ProtocolError;
use crate::frame::usable_payload;
use crate::id::CorrelationId;
use crate::{CLOSE_NORMAL, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Header map: one value per name.
pub type HeaderMap = HashMap<String, String>;

/// Control frame, sent as a JSON text message and tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Message(MessageFrame),
    Error(ErrorFrame),
    Connect(ConnectFrame),
    Open(OpenFrame),
    Close(CloseFrame),
}

impl ControlFrame {
    /// Values accepted in the `type` field.
    pub const TYPES: [&'static str; 7] = [
        "request", "response", "message", "error", "connect", "open", "close",
    ];

    /// Returns the correlation id carried by the frame.
    ///
    /// Only `error` frames may lack one.
    pub fn id(&self) -> Option<CorrelationId> {
        match self {
            ControlFrame::Request(f) => Some(f.id),
            ControlFrame::Response(f) => Some(f.id),
            ControlFrame::Message(f) => Some(f.id),
            ControlFrame::Error(f) => f.id,
            ControlFrame::Connect(f) => Some(f.id),
            ControlFrame::Open(f) => Some(f.id),
            ControlFrame::Close(f) => Some(f.id),
        }
    }

    /// Returns the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::Request(_) => "request",
            ControlFrame::Response(_) => "response",
            ControlFrame::Message(_) => "message",
            ControlFrame::Error(_) => "error",
            ControlFrame::Connect(_) => "connect",
            ControlFrame::Open(_) => "open",
            ControlFrame::Close(_) => "close",
        }
    }
}

/// Outbound HTTP-style request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub id: CorrelationId,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Body size in bytes; absent when there is no body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_length: Option<usize>,
}

impl RequestFrame {
    pub fn new(id: CorrelationId, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body_length: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Response metadata for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub id: CorrelationId,
    /// Final URL, after redirects.
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_length: Option<usize>,
}

impl ResponseFrame {
    pub fn new(id: CorrelationId, url: impl Into<String>, status: u16) -> Self {
        Self {
            id,
            url: url.into(),
            status,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body_length: None,
        }
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns the declared body length, treating an absent field as zero.
    pub fn declared_length(&self) -> usize {
        self.body_length.unwrap_or(0)
    }
}

/// Payload kind of a tunnel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Binary,
}

/// Announces one tunnel message whose payload follows as chunk frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: CorrelationId,
    pub length: usize,
    pub kind: MessageKind,
}

/// Failure reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    pub code: String,
    #[serde(default)]
    pub key: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            code: code.into(),
            key: String::new(),
            message: message.into(),
        }
    }

    pub fn for_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

/// Requests a tunnel to a remote WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectFrame {
    pub id: CorrelationId,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub protocols: Vec<String>,
}

/// Confirms a tunnel is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenFrame {
    pub id: CorrelationId,
    /// Sub-protocol selected by the remote endpoint, empty if none.
    #[serde(default)]
    pub protocol: String,
}

/// Closes a tunnel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseFrame {
    pub id: CorrelationId,
    #[serde(default = "default_close_code")]
    pub code: u16,
    #[serde(default)]
    pub reason: String,
}

fn default_close_code() -> u16 {
    CLOSE_NORMAL
}

// ============================================================================
// Capabilities
// ============================================================================

/// Server limits and identity, negotiated once per client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Protocol versions the server speaks, in preference order.
    pub versions: Vec<u32>,
    /// Request timeout in seconds.
    #[serde(rename = "requestTimeout")]
    pub request_timeout_secs: u64,
    pub max_body_size: usize,
    pub max_in_message_size: usize,
    /// Largest binary message, chunk header included.
    #[serde(alias = "maximumPacketSize")]
    pub max_packet_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<Maintainer>,
    pub project: Project,
}

/// Operator contact details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Maintainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

/// Server implementation identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl Capabilities {
    /// Checks the limits are usable by this client.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        usable_payload(self.max_packet_size)?;

        if self.request_timeout_secs == 0 {
            return Err(ProtocolError::InvalidCapabilities(
                "requestTimeout must be positive",
            ));
        }

        if !self.versions.is_empty() && !self.supports(PROTOCOL_VERSION) {
            return Err(ProtocolError::UnsupportedVersion(self.versions.clone()));
        }

        Ok(())
    }

    /// Returns whether the server speaks `version`.
    pub fn supports(&self, version: u32) -> bool {
        self.versions.contains(&version)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Payload bytes per chunk frame.
    pub fn usable_packet_size(&self) -> usize {
        self.max_packet_size.saturating_sub(crate::CHUNK_HEADER_SIZE)
    }
}

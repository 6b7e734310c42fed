//! Stateless encoder and decoder for wsmux frames.

use crate::error::ProtocolError;
use crate::frame::{chunk_payload, ChunkFrame, WireMessage};
use crate::id::CorrelationId;
use crate::message::{ControlFrame, MessageFrame, MessageKind, RequestFrame, ResponseFrame};
use bytes::Bytes;
use serde_json::Value;

/// A control frame followed by the chunk frames carrying its payload.
#[derive(Debug, Clone)]
pub struct EncodedFrames {
    /// JSON text of the control frame.
    pub control: String,
    /// Encoded chunk frames, in index order.
    pub chunks: Vec<Bytes>,
}

impl EncodedFrames {
    /// Number of WebSocket messages needed to send these frames.
    pub fn message_count(&self) -> usize {
        1 + self.chunks.len()
    }

    /// Converts into WebSocket messages in send order.
    pub fn into_messages(self) -> Vec<WireMessage> {
        let mut messages = Vec::with_capacity(self.message_count());
        messages.push(WireMessage::Text(self.control));
        messages.extend(self.chunks.into_iter().map(WireMessage::Binary));
        messages
    }
}

/// Encodes control frames and payloads.
pub struct Encoder;

impl Encoder {
    /// Encodes a single control frame.
    pub fn encode_control(frame: &ControlFrame) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Encodes a request and splits its body into chunk frames.
    ///
    /// The frame's `bodyLength` is set from `body`; an empty body leaves it
    /// absent and produces no chunks.
    pub fn encode_request(
        mut request: RequestFrame,
        body: Bytes,
        max_packet_size: usize,
    ) -> Result<EncodedFrames, ProtocolError> {
        request.body_length = (!body.is_empty()).then_some(body.len());
        let chunks = chunk_payload(request.id, &body, max_packet_size)?;
        let control = Self::encode_control(&ControlFrame::Request(request))?;
        Ok(EncodedFrames { control, chunks })
    }

    /// Encodes a response and splits its body into chunk frames.
    pub fn encode_response(
        mut response: ResponseFrame,
        body: Bytes,
        max_packet_size: usize,
    ) -> Result<EncodedFrames, ProtocolError> {
        response.body_length = (!body.is_empty()).then_some(body.len());
        let chunks = chunk_payload(response.id, &body, max_packet_size)?;
        let control = Self::encode_control(&ControlFrame::Response(response))?;
        Ok(EncodedFrames { control, chunks })
    }

    /// Encodes one tunnel message: a `message` frame plus its chunks.
    pub fn encode_message(
        id: CorrelationId,
        kind: MessageKind,
        payload: Bytes,
        max_packet_size: usize,
    ) -> Result<EncodedFrames, ProtocolError> {
        let chunks = chunk_payload(id, &payload, max_packet_size)?;
        let control = Self::encode_control(&ControlFrame::Message(MessageFrame {
            id,
            length: payload.len(),
            kind,
        }))?;
        Ok(EncodedFrames { control, chunks })
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlFrame),
    Chunk(ChunkFrame),
}

/// Decodes inbound WebSocket messages.
pub struct Decoder;

impl Decoder {
    /// Decodes one message: text is a control frame, binary is a chunk.
    pub fn decode(message: WireMessage) -> Result<Inbound, ProtocolError> {
        match message {
            WireMessage::Text(text) => Self::decode_control(&text).map(Inbound::Control),
            WireMessage::Binary(data) => ChunkFrame::decode(data).map(Inbound::Chunk),
        }
    }

    /// Decodes a control frame.
    ///
    /// Unknown `type` tags and shape errors keep the frame's `id` when it can
    /// be read, so the failure can be routed to the operation it belongs to.
    pub fn decode_control(text: &str) -> Result<ControlFrame, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidControlFrame {
                reason: e.to_string(),
                id: None,
            })?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<CorrelationId>().ok());

        match value.get("type").and_then(Value::as_str) {
            Some(tag) if ControlFrame::TYPES.contains(&tag) => serde_json::from_value(value)
                .map_err(|e| ProtocolError::InvalidControlFrame {
                    reason: e.to_string(),
                    id,
                }),
            Some(tag) => Err(ProtocolError::UnknownFrameType {
                frame_type: tag.to_string(),
                id,
            }),
            None => Err(ProtocolError::InvalidControlFrame {
                reason: "missing \"type\" field".to_string(),
                id,
            }),
        }
    }
}

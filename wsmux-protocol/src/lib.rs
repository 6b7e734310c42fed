//! # wsmux-protocol
//!
//! Wire protocol for wsmux, a request multiplexer that carries HTTP-style
//! exchanges and WebSocket tunnels over one WebSocket connection.
//!
//! This crate provides:
//! - JSON control frames (`request`, `response`, `message`, `error`,
//!   `connect`, `open`, `close`)
//! - Binary chunk frames with an 18-byte header (correlation id + index)
//! - Server capability records
//! - Stateless encode/decode helpers

pub mod codec;
pub mod error;
pub mod frame;
pub mod id;
pub mod message;

pub use codec::{Decoder, EncodedFrames, Encoder, Inbound};
pub use error::ProtocolError;
pub use frame::{ChunkFrame, WireMessage, CHUNK_HEADER_SIZE, MAX_CHUNKS};
pub use id::CorrelationId;
pub use message::{
    Capabilities, CloseFrame, ConnectFrame, ControlFrame, ErrorFrame, HeaderMap, Maintainer,
    MessageFrame, MessageKind, OpenFrame, Project, RequestFrame, ResponseFrame,
};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Close code sent when a tunnel is closed without an explicit code.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when a tunnel is torn down for a framing violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close code reported to tunnels when the underlying connection drops.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code sent when a tunnel's receiver cannot keep up.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

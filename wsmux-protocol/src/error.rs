//! Protocol error types.

use crate::id::CorrelationId;
use thiserror::Error;

/// Protocol-level errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("chunk frame too short: {len} bytes (header is 18)")]
    ShortChunk { len: usize },

    #[error("unknown control frame type: {frame_type:?}")]
    UnknownFrameType {
        frame_type: String,
        id: Option<CorrelationId>,
    },

    #[error("invalid control frame: {reason}")]
    InvalidControlFrame {
        reason: String,
        id: Option<CorrelationId>,
    },

    #[error("invalid correlation id: {0:?}")]
    InvalidCorrelationId(String),

    #[error("packet size {0} leaves no room for payload (header is 18 bytes)")]
    PacketTooSmall(usize),

    #[error("payload of {len} bytes needs {chunks} chunks (max 65536)")]
    TooManyChunks { len: usize, chunks: usize },

    #[error("unsupported protocol versions: {0:?}")]
    UnsupportedVersion(Vec<u32>),

    #[error("invalid capabilities: {0}")]
    InvalidCapabilities(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns the correlation id a malformed frame claimed, if it had one.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            ProtocolError::UnknownFrameType { id, .. }
            | ProtocolError::InvalidControlFrame { id, .. } => *id,
            _ => None,
        }
    }

    /// Returns whether this error describes a frame received from the peer.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            ProtocolError::ShortChunk { .. }
                | ProtocolError::UnknownFrameType { .. }
                | ProtocolError::InvalidControlFrame { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::ShortChunk { len: 5 };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains("18"));

        let err = ProtocolError::UnknownFrameType {
            frame_type: "bogus".into(),
            id: None,
        };
        assert!(err.to_string().contains("bogus"));

        let err = ProtocolError::PacketTooSmall(18);
        assert!(err.to_string().contains("18"));

        let err = ProtocolError::TooManyChunks {
            len: 10,
            chunks: 70_000,
        };
        assert!(err.to_string().contains("70000"));

        let err = ProtocolError::UnsupportedVersion(vec![2, 3]);
        assert!(err.to_string().contains("[2, 3]"));
    }

    #[test]
    fn test_correlation_id_attribution() {
        let id = CorrelationId::new();
        let err = ProtocolError::UnknownFrameType {
            frame_type: "x".into(),
            id: Some(id),
        };
        assert_eq!(err.correlation_id(), Some(id));

        let err = ProtocolError::InvalidControlFrame {
            reason: "missing field".into(),
            id: Some(id),
        };
        assert_eq!(err.correlation_id(), Some(id));

        assert_eq!(ProtocolError::ShortChunk { len: 3 }.correlation_id(), None);
    }

    #[test]
    fn test_is_malformed_frame() {
        assert!(ProtocolError::ShortChunk { len: 0 }.is_malformed_frame());
        assert!(!ProtocolError::PacketTooSmall(1).is_malformed_frame());
        assert!(!ProtocolError::TooManyChunks { len: 1, chunks: 1 }.is_malformed_frame());
    }
}

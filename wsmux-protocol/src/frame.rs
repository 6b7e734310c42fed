//! Binary chunk frames.
//!
//! Bodies that do not fit in one packet travel as a sequence of binary
//! WebSocket messages, each prefixed by an 18-byte header:
//!
//! ```text
//! +------------------+-------------+---------------------------------+
//! | correlation id   | chunk index | payload                         |
//! | 16 bytes (raw)   | 2 bytes BE  | <= max_packet_size - 18 bytes   |
//! +------------------+-------------+---------------------------------+
//! ```
//!
//! Indices are dense and start at 0. Only the final chunk may be shorter than
//! the usable packet size. An empty body produces no chunks at all.

use crate::error::ProtocolError;
use crate::id::{CorrelationId, ID_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed chunk header in bytes (16 + 2 = 18).
pub const CHUNK_HEADER_SIZE: usize = ID_SIZE + 2;

/// Highest number of chunks a 2-byte index can address.
pub const MAX_CHUNKS: usize = u16::MAX as usize + 1;

/// One message as delivered by the WebSocket layer.
///
/// Text messages always carry control frames, binary messages always carry
/// chunk frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    /// Returns the message size in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, WireMessage::Text(_))
    }
}

/// A decoded chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub id: CorrelationId,
    pub index: u16,
    pub payload: Bytes,
}

impl ChunkFrame {
    pub fn new(id: CorrelationId, index: u16, payload: Bytes) -> Self {
        Self { id, index, payload }
    }

    /// Encodes the header and payload into one binary message body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.payload.len());
        buf.put_slice(self.id.as_bytes());
        buf.put_u16(self.index);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a binary message body.
    ///
    /// The payload is a zero-copy slice of `data`.
    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(ProtocolError::ShortChunk { len: data.len() });
        }

        let id = CorrelationId::from_slice(&data[..ID_SIZE])?;
        let index = u16::from_be_bytes([data[ID_SIZE], data[ID_SIZE + 1]]);
        let payload = data.slice(CHUNK_HEADER_SIZE..);

        Ok(Self { id, index, payload })
    }
}

/// Returns how many payload bytes fit in one packet.
pub fn usable_payload(max_packet_size: usize) -> Result<usize, ProtocolError> {
    if max_packet_size <= CHUNK_HEADER_SIZE {
        return Err(ProtocolError::PacketTooSmall(max_packet_size));
    }
    Ok(max_packet_size - CHUNK_HEADER_SIZE)
}

/// Returns the number of chunks needed for a body of `len` bytes.
pub fn chunk_count(len: usize, max_packet_size: usize) -> Result<usize, ProtocolError> {
    let usable = usable_payload(max_packet_size)?;
    Ok(len.div_ceil(usable))
}

/// Splits `payload` into encoded chunk frames for `id`, in index order.
pub fn chunk_payload(
    id: CorrelationId,
    payload: &Bytes,
    max_packet_size: usize,
) -> Result<Vec<Bytes>, ProtocolError> {
    let usable = usable_payload(max_packet_size)?;
    let chunks = payload.len().div_ceil(usable);
    if chunks > MAX_CHUNKS {
        return Err(ProtocolError::TooManyChunks {
            len: payload.len(),
            chunks,
        });
    }

    let mut frames = Vec::with_capacity(chunks);
    for index in 0..chunks {
        let start = index * usable;
        let end = (start + usable).min(payload.len());
        let chunk = ChunkFrame::new(id, index as u16, payload.slice(start..end));
        frames.push(chunk.encode());
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_roundtrip() {
        let id = CorrelationId::new();
        let chunk = ChunkFrame::new(id, 513, Bytes::from_static(b"hello"));

        let encoded = chunk.encode();
        assert_eq!(encoded.len(), CHUNK_HEADER_SIZE + 5);
        assert_eq!(&encoded[..16], id.as_bytes());
        // Index is big-endian: 513 = 0x0201
        assert_eq!(&encoded[16..18], &[0x02, 0x01]);

        let decoded = ChunkFrame::decode(encoded).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_short_chunk_rejected() {
        let result = ChunkFrame::decode(Bytes::from_static(&[0u8; 17]));
        assert!(matches!(result, Err(ProtocolError::ShortChunk { len: 17 })));
    }

    #[test]
    fn test_header_only_chunk_has_empty_payload() {
        let decoded = ChunkFrame::decode(Bytes::from(vec![9u8; CHUNK_HEADER_SIZE])).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.index, 0x0909);
    }

    #[test]
    fn test_usable_payload_requires_room() {
        assert!(matches!(
            usable_payload(18),
            Err(ProtocolError::PacketTooSmall(18))
        ));
        assert_eq!(usable_payload(19).unwrap(), 1);
        assert_eq!(usable_payload(1024).unwrap(), 1006);
    }

    #[test]
    fn test_chunk_sizes_for_2003_byte_body() {
        let id = CorrelationId::new();
        let body = Bytes::from(vec![0x5A; 2003]);

        let frames = chunk_payload(id, &body, 1024).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len() - CHUNK_HEADER_SIZE, 1006);
        assert_eq!(frames[1].len() - CHUNK_HEADER_SIZE, 997);

        let first = ChunkFrame::decode(frames[0].clone()).unwrap();
        let second = ChunkFrame::decode(frames[1].clone()).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
    }

    #[test]
    fn test_empty_payload_has_no_chunks() {
        let frames = chunk_payload(CorrelationId::new(), &Bytes::new(), 1024).unwrap();
        assert!(frames.is_empty());
        assert_eq!(chunk_count(0, 1024).unwrap(), 0);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_chunk() {
        assert_eq!(chunk_count(2012, 1024).unwrap(), 2);
        assert_eq!(chunk_count(2013, 1024).unwrap(), 3);
    }

    #[test]
    fn test_too_many_chunks() {
        // 19-byte packets carry one payload byte each.
        let body = Bytes::from(vec![0u8; MAX_CHUNKS + 1]);
        let result = chunk_payload(CorrelationId::new(), &body, 19);
        assert!(matches!(
            result,
            Err(ProtocolError::TooManyChunks { chunks, .. }) if chunks == MAX_CHUNKS + 1
        ));
    }

    #[test]
    fn test_max_chunks_fit() {
        let body = Bytes::from(vec![1u8; MAX_CHUNKS]);
        let frames = chunk_payload(CorrelationId::new(), &body, 19).unwrap();
        assert_eq!(frames.len(), MAX_CHUNKS);
        let last = ChunkFrame::decode(frames[MAX_CHUNKS - 1].clone()).unwrap();
        assert_eq!(last.index, u16::MAX);
    }

    #[test]
    fn test_wire_message_len() {
        assert_eq!(WireMessage::Text("abc".into()).len(), 3);
        assert!(WireMessage::Binary(Bytes::new()).is_empty());
        assert!(WireMessage::Text(String::new()).is_text());
    }
}

//! Frame encoding/decoding for the AMQP 0-9-1 wire format
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |     Channel (2B)         |
//! +--------+--------+--------+--------+
//! |         Payload Size (4B)         |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! |        Frame End (0xCE)           |
//! +--------+--------+--------+--------+
//! ```
//!
//! All multi-byte fields are big endian. The payload is carried opaquely;
//! interpreting frame types and method payloads belongs to the connection
//! layer above. No payload size cap is enforced here, the protocol layer
//! negotiates its own frame-size limit.

use crate::transport::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes (type + channel + payload size)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Trailer byte that terminates every frame
pub const FRAME_END: u8 = 0xCE;

/// The fixed part of a frame, parsed ahead of the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type octet (method, header, body, heartbeat)
    pub frame_type: u8,
    /// Channel number (0 for connection-level frames)
    pub channel: u16,
    /// Payload size in bytes
    pub size: u32,
}

impl FrameHeader {
    /// Parse a header from the first [`FRAME_HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Any 7 octets form a valid header; validation of the payload that
    /// follows is the caller's job. Panics if `bytes` is shorter than
    /// [`FRAME_HEADER_SIZE`].
    pub fn parse(bytes: &[u8]) -> Self {
        let mut bytes = &bytes[..FRAME_HEADER_SIZE];
        Self {
            frame_type: bytes.get_u8(),
            channel: bytes.get_u16(),
            size: bytes.get_u32(),
        }
    }

    /// Total encoded size of the frame this header describes.
    ///
    /// Returned as `u64`: a wire-supplied size near `u32::MAX` plus the
    /// envelope overhead does not fit a 32-bit `usize`.
    pub fn frame_size(&self) -> u64 {
        FRAME_HEADER_SIZE as u64 + u64::from(self.size) + 1
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type octet, passed through uninterpreted
    pub frame_type: u8,
    /// Channel number
    pub channel: u16,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: u8, channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            channel,
            payload,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());

        // Type (1 byte)
        buf.put_u8(self.frame_type);

        // Channel (2 bytes, big endian)
        buf.put_u16(self.channel);

        // Payload size (4 bytes)
        buf.put_u32(self.payload.len() as u32);

        // Payload
        buf.extend_from_slice(&self.payload);

        // Trailer
        buf.put_u8(FRAME_END);

        buf
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame. On
    /// success the frame's bytes are consumed from `buf`; any bytes of a
    /// following frame are left in place.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TransportError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header to learn the payload size
        let header = FrameHeader::parse(&buf[..FRAME_HEADER_SIZE]);

        if (buf.len() as u64) < header.frame_size() {
            return Ok(None);
        }

        // Consume header
        buf.advance(FRAME_HEADER_SIZE);

        // Read payload
        let payload = buf.split_to(header.size as usize).freeze();

        // The trailer octet guards against desynchronized framing
        let trailer = buf.get_u8();
        if trailer != FRAME_END {
            return Err(TransportError::UnexpectedFrameTrailer { found: trailer });
        }

        Ok(Some(Self {
            frame_type: header.frame_type,
            channel: header.channel,
            payload,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::new(1, 42, Bytes::from_static(b"Hello, World!"));
        let mut encoded = original.encode();

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.frame_type, original.frame_type);
        assert_eq!(decoded.channel, original.channel);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_heartbeat_frame_wire_bytes() {
        // A heartbeat is the smallest frame: empty payload on channel 0.
        let frame = Frame::new(8, 0, Bytes::new());
        let encoded = frame.encode();

        assert_eq!(&encoded[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
        assert_eq!(frame.encoded_size(), 8);
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let frame = Frame::new(2, 1, Bytes::from_static(b"content header"));
        let encoded = frame.encode();

        // Neither a partial header nor a partial payload yields a frame.
        let mut partial = BytesMut::from(&encoded[..3]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), encoded.len() - 1);
    }

    #[test]
    fn test_decode_maximal_declared_size() {
        // Worst-case length field: the completeness check must not wrap
        // on 32-bit targets, and nothing may be consumed.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
        buf.extend_from_slice(&[0u8; 32]);

        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 32);
    }

    #[test]
    fn test_decode_bad_trailer() {
        let mut encoded = Frame::new(1, 7, Bytes::from_static(b"xyz")).encode();
        let last = encoded.len() - 1;
        encoded[last] = 0x42;

        match Frame::decode(&mut encoded) {
            Err(TransportError::UnexpectedFrameTrailer { found }) => assert_eq!(found, 0x42),
            other => panic!("expected trailer error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_leaves_following_bytes() {
        let first = Frame::new(1, 1, Bytes::from_static(b"one"));
        let second = Frame::new(3, 1, Bytes::from_static(b"two"));

        let mut buf = first.encode();
        buf.extend_from_slice(&second.encode());

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, first);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_parse() {
        let header = FrameHeader::parse(&[1, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x00]);

        assert_eq!(header.frame_type, 1);
        assert_eq!(header.channel, 11);
        assert_eq!(header.size, 256);
        assert_eq!(header.frame_size(), 7 + 256 + 1);
    }
}

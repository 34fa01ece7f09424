//! # Built-in Frame Format
//!
//! A small length-prefixed wire format shipped with the crate. Servers use it
//! through [`FrameProtocol`](crate::protocol::FrameProtocol); clients and tests
//! use [`FrameCodec`] with `tokio_util::codec::Framed`.
//!
//! ## Wire Format
//! ```text
//! [Magic(4) "TCPC"] [Version(1)] [Length(4, big endian)] [Payload(N)]
//! ```
//!
//! Bytes that cannot start a frame are discarded one at a time until the
//! buffer begins with the magic (or a prefix of it), so a peer that sends
//! garbage between frames does not desynchronise the stream. The decision to
//! discard a byte only depends on the bytes at that position, which keeps the
//! decoded sequence independent of how the stream was chunked.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::Packet;
use crate::error::{ConduitError, Result};

/// Magic bytes opening every frame
pub const FRAME_MAGIC: [u8; 4] = *b"TCPC";

/// Current frame version
pub const FRAME_VERSION: u8 = 1;

/// Magic + version + length
pub const HEADER_LEN: usize = 9;

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version: FRAME_VERSION,
            payload: payload.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&FRAME_MAGIC);
        out.push(self.version);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse exactly one frame from the start of `buf`.
    ///
    /// Unlike [`Frame::decode`] this never skips bytes: anything that is not
    /// a complete, well-formed frame is an error.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN || buf[..4] != FRAME_MAGIC {
            return Err(ConduitError::InvalidHeader);
        }
        let (version, len) = parse_header(buf)?;
        let end = HEADER_LEN + len;
        if buf.len() < end {
            return Err(ConduitError::InvalidHeader);
        }
        Ok(Self {
            version,
            payload: buf[HEADER_LEN..end].to_vec(),
        })
    }

    /// Take the next complete frame out of an accumulation buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes of a returned
    /// frame are removed from `buf`; a partial frame is left untouched.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        discard_garbage(buf);
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let (version, len) = parse_header(buf)?;
        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).to_vec();
        Ok(Some(Self { version, payload }))
    }
}

impl Packet for Frame {
    fn serialize(&self) -> Vec<u8> {
        self.to_bytes()
    }
}

fn parse_header(buf: &[u8]) -> Result<(u8, usize)> {
    let version = buf[4];
    if version != FRAME_VERSION {
        return Err(ConduitError::UnsupportedVersion(version));
    }
    let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ConduitError::OversizedPacket(len));
    }
    Ok((version, len))
}

/// Drop leading bytes until `buf` starts with the magic or a prefix of it.
fn discard_garbage(buf: &mut BytesMut) -> usize {
    let mut skip = 0;
    while skip < buf.len() {
        let rest = &buf[skip..];
        let n = rest.len().min(FRAME_MAGIC.len());
        if rest[..n] == FRAME_MAGIC[..n] {
            break;
        }
        skip += 1;
    }
    if skip > 0 {
        tracing::debug!(discarded = skip, "Skipped bytes preceding frame magic");
        buf.advance(skip);
    }
    skip
}

/// Tokio codec for [`Frame`]
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ConduitError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        Frame::decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ConduitError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ConduitError::OversizedPacket(item.payload.len()));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u8(item.version);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn decode_leaves_partial_frame_untouched() {
        let bytes = Frame::new(vec![1, 2, 3]).to_bytes();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);

        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), bytes.len() - 1);
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(b"one".to_vec()).to_bytes());
        buf.extend_from_slice(&Frame::new(b"two".to_vec()).to_bytes());

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(buf.len(), HEADER_LEN + 3);

        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload, b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_before_magic_is_skipped() {
        let mut buf = BytesMut::from(&[0xFF, 0x00, b'T', 0x13][..]);
        buf.extend_from_slice(&Frame::new(vec![9]).to_bytes());

        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, vec![9]);
        assert!(buf.is_empty());
    }

    #[test]
    fn magic_prefix_at_end_is_kept() {
        let mut buf = BytesMut::from(&[0x01, b'T', b'C'][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"TC");
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u32(20_000_000);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ConduitError::OversizedPacket(20_000_000))
        ));
    }

    #[test]
    fn unknown_version_is_fatal() {
        let mut bytes = Frame::new(vec![1]).to_bytes();
        bytes[4] = 42;
        let mut buf = BytesMut::from(&bytes[..]);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ConduitError::UnsupportedVersion(42))
        ));
    }

    #[test]
    fn from_bytes_rejects_truncation() {
        let bytes = Frame::new(vec![1, 2, 3]).to_bytes();
        assert!(matches!(
            Frame::from_bytes(&bytes[..5]),
            Err(ConduitError::InvalidHeader)
        ));
        assert!(matches!(
            Frame::from_bytes(&bytes[..bytes.len() - 1]),
            Err(ConduitError::InvalidHeader)
        ));
        assert_eq!(Frame::from_bytes(&bytes).unwrap().payload, vec![1, 2, 3]);
    }

    #[test]
    fn codec_encoding_matches_serialize() {
        let frame = Frame::new(b"payload".to_vec());
        let mut dst = BytesMut::new();
        FrameCodec.encode(frame.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &frame.serialize()[..]);
    }
}

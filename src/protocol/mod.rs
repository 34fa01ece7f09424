//! # Protocol Capability
//!
//! A [`Protocol`] turns the raw bytes of one connection into packets. The read
//! loop of every connection calls [`Protocol::read_packet`] repeatedly with
//! that connection's [`ByteSource`].
//!
//! ## Outcomes of `read_packet`
//! - `Ok(packet)`: a complete frame was taken out of the accumulation buffer
//! - `Err(ConduitError::IncompleteFrame)`: not enough bytes yet; the read loop
//!   calls again without treating this as a failure
//! - any other error: the connection is closed
//!
//! Implementations own all buffering and resynchronisation logic. The
//! accumulation buffer lives as long as the connection, so bytes of a partial
//! frame survive between calls.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::frame::Frame;
use crate::core::packet::Packet;
use crate::error::{ConduitError, Result};

pub mod callback;

/// Default number of bytes requested from the socket per read
pub const DEFAULT_READ_CHUNK: usize = 1024;

/// Frames raw bytes into packets for one wire format.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    type Packet: Packet;

    async fn read_packet(&self, source: &mut ByteSource) -> Result<Self::Packet>;
}

/// The byte side of a connection as seen by a [`Protocol`]: the socket read
/// half plus the receive accumulation buffer.
///
/// Owned by the read loop of a single connection, so the buffer is never
/// touched concurrently.
pub struct ByteSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    buffer: BytesMut,
    chunk_size: usize,
    peer_addr: Option<SocketAddr>,
    bytes_read: u64,
}

impl ByteSource {
    pub fn new<R>(reader: R, chunk_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let chunk_size = chunk_size.max(1);
        Self {
            reader: Box::new(reader),
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            peer_addr: None,
            bytes_read: 0,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Read once from the socket and append what arrived to the buffer.
    ///
    /// Returns the number of new bytes. End of stream is reported as
    /// [`ConduitError::PeerClosed`].
    pub async fn fill(&mut self) -> Result<usize> {
        self.buffer.reserve(self.chunk_size);
        let n = (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_buf(&mut self.buffer)
            .await?;
        if n == 0 {
            return Err(ConduitError::PeerClosed);
        }
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Mutable access to the accumulation buffer, for consuming completed frames.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes received but not yet claimed by a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Total bytes pulled from the socket so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// [`Protocol`] for the built-in [`Frame`] format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameProtocol;

#[async_trait]
impl Protocol for FrameProtocol {
    type Packet = Frame;

    async fn read_packet(&self, source: &mut ByteSource) -> Result<Frame> {
        if let Some(frame) = Frame::decode(source.buffer())? {
            return Ok(frame);
        }
        source.fill().await?;
        Frame::decode(source.buffer())?.ok_or(ConduitError::IncompleteFrame)
    }
}

//! # Error Types
//!
//! Error handling for the connection engine, the framing layer and the
//! registry bridge.
//!
//! ## Error Kinds
//! - **Closing**: the connection (or one of its queues) is already closed.
//!   Never retried.
//! - **Would-block**: a non-blocking or timed queue operation found no data
//!   or no capacity in time. The caller decides whether to retry.
//! - **Incomplete frame**: a [`Protocol`](crate::protocol::Protocol) needs
//!   more bytes. Never surfaced to the application and never closes the
//!   connection.
//! - **Fatal**: everything else (socket I/O, framing corruption, heartbeat
//!   expiry). Always terminates the connection through its close routine.
//!
//! ## Example Usage
//! ```rust
//! use tcp_conduit::error::{ConduitError, Result};
//!
//! fn classify(result: Result<()>) -> &'static str {
//!     match result {
//!         Ok(()) => "ok",
//!         Err(e) if e.is_would_block() => "retry later",
//!         Err(e) if e.is_closing() => "gone",
//!         Err(_) => "fatal",
//!     }
//! }
//!
//! assert_eq!(classify(Err(ConduitError::WriteBlocking)), "retry later");
//! assert_eq!(classify(Err(ConduitError::ConnectionClosing)), "gone");
//! ```

use std::io;
use thiserror::Error;

// ConduitError is the single error type surfaced by the crate
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("use of closed network connection")]
    ConnectionClosing,

    #[error("read packet was blocking")]
    ReadBlocking,

    #[error("write packet was blocking")]
    WriteBlocking,

    #[error("read half packet")]
    IncompleteFrame,

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ConduitError {
    /// A non-blocking or timed queue operation could not complete in time.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::ReadBlocking | Self::WriteBlocking)
    }

    /// The target connection or queue is closed.
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::ConnectionClosing)
    }

    /// The framing layer needs more bytes.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::IncompleteFrame)
    }

    /// Errors that terminate a connection when raised inside one of its loops.
    pub fn is_fatal(&self) -> bool {
        !(self.is_would_block() || self.is_incomplete())
    }
}

/// Type alias for Results using ConduitError
pub type Result<T> = std::result::Result<T, ConduitError>;

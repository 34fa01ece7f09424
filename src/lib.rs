//! # tcp-conduit
//!
//! A reusable TCP server core. It accepts connections, frames raw byte
//! streams into packets through a pluggable [`Protocol`](protocol::Protocol),
//! hands packets to application [`Callback`](protocol::callback::Callback)s
//! and manages the concurrent lifecycle of every connection: bounded
//! send/receive queues, heartbeat expiry, exactly-once teardown and graceful
//! shutdown.
//!
//! The crate knows nothing about concrete device protocols or business
//! semantics; those live in the `Protocol`, `Packet` and `Callback`
//! implementations supplied by the application.
//!
//! ## Modules
//! - [`core`]: packet capability, bounded queue, built-in frame format
//! - [`protocol`]: framing contract, byte source, callback contract
//! - [`transport`]: connection engine and accept loop
//! - [`registry`]: connection registry and broker bridge
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod utils;

pub use crate::core::frame::{Frame, FrameCodec};
pub use crate::core::packet::Packet;
pub use crate::error::{ConduitError, Result};
pub use crate::protocol::callback::Callback;
pub use crate::protocol::{ByteSource, FrameProtocol, Protocol};
pub use crate::registry::{ConnectionHub, Registry};
pub use crate::transport::connection::Connection;
pub use crate::transport::server::Server;

//! # Core Building Blocks
//!
//! Packet capability, queueing and the built-in frame format.
//!
//! ## Components
//! - **Packet**: the only thing the engine needs from application data is its wire bytes
//! - **Queue**: closable bounded FIFO providing backpressure between connection loops
//! - **Frame**: reference length-prefixed format and its Tokio codec
//!
//! ## Wire Format (built-in frames)
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```

pub mod frame;
pub mod packet;
pub mod queue;

//! # Transport
//!
//! The connection engine: the accept loop and the per-connection tasks.
//!
//! ## Lifecycle
//! ```text
//! accept ─► Connection ─► Registry::register ─► Callback::on_connect
//!        ─► read / write / dispatch / broker write / heartbeat
//!        ─► close (exactly once) ─► Registry::deregister ─► Callback::on_close
//! ```
//!
//! ## Shutdown
//! [`server::Server::stop`] cancels the shared token and waits on the shared
//! task tracker, so it returns only after every loop of every connection and
//! the accept loop have exited.

pub mod connection;
pub mod server;

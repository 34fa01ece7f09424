use std::sync::Arc;

use async_trait::async_trait;

use crate::core::packet::Packet;
use crate::transport::connection::Connection;

/// Application hooks invoked by the connection engine.
///
/// One instance is shared by every connection of a server.
#[async_trait]
pub trait Callback<T: Packet>: Send + Sync + 'static {
    /// Called once right after accept. Returning `false` closes the connection
    /// before any of its loops start.
    async fn on_connect(&self, conn: &Arc<Connection<T>>) -> bool;

    /// Called for every framed packet, in arrival order. Returning `false`
    /// closes the connection.
    async fn on_message(&self, conn: &Arc<Connection<T>>, packet: T) -> bool;

    /// Called at most once per connection, from its close routine.
    fn on_close(&self, conn: &Connection<T>);
}

//! # Connection Registry
//!
//! Maps connection indices and application identifiers (e.g. device
//! addresses) to live connections, and bridges outward to a pub/sub broker.
//!
//! The server registers every accepted connection; each connection's close
//! routine deregisters it exactly once. Application logic binds an
//! identifier after its handshake through
//! [`Connection::bind_identifier`](crate::transport::connection::Connection::bind_identifier).
//!
//! A broker consumer delivers commands to a device through
//! [`ConnectionHub::deliver`], which uses the connection's public
//! broker-write entry point.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::packet::Packet;
use crate::error::{ConduitError, Result};
use crate::transport::connection::Connection;

/// Registry contract consumed by the connection engine.
///
/// Implementations must tolerate concurrent calls from the accept loop, from
/// close routines and from broker consumers.
pub trait Registry<T: Packet>: Send + Sync + 'static {
    fn register(&self, index: u32, conn: Arc<Connection<T>>);

    /// Associate `identifier` with the connection registered under `index`.
    fn bind(&self, identifier: &str, index: u32);

    /// Remove the connection; `identifier` is the one it was bound to, if any.
    fn deregister(&self, index: u32, identifier: Option<&str>);

    fn lookup(&self, identifier: &str) -> Option<Arc<Connection<T>>>;

    fn exists(&self, identifier: &str) -> bool;

    /// Forward data outward to the broker.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Outbound side of the broker bridge.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Publisher feeding a bounded channel drained by a broker client task.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<BrokerMessage>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BrokerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.tx
            .try_send(BrokerMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConduitError::WriteBlocking,
                mpsc::error::TrySendError::Closed(_) => {
                    ConduitError::Publish("broker channel closed".to_string())
                }
            })
    }
}

/// Publisher that drops everything, for servers without a broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPublisher;

impl Publisher for DiscardPublisher {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        debug!(topic, bytes = payload.len(), "Discarding broker message");
        Ok(())
    }
}

struct HubMaps<T: Packet> {
    conns: HashMap<u32, Arc<Connection<T>>>,
    identifiers: HashMap<String, u32>,
}

/// In-memory [`Registry`].
///
/// Both maps sit behind one lock so a lookup never observes an identifier
/// pointing at a connection that is half removed. Identifiers are compared
/// case-insensitively (normalised to ASCII upper case).
pub struct ConnectionHub<T: Packet> {
    maps: RwLock<HubMaps<T>>,
    publisher: Arc<dyn Publisher>,
}

impl<T: Packet> ConnectionHub<T> {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            maps: RwLock::new(HubMaps {
                conns: HashMap::new(),
                identifiers: HashMap::new(),
            }),
            publisher,
        }
    }

    pub fn get(&self, index: u32) -> Option<Arc<Connection<T>>> {
        self.read().conns.get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().conns.is_empty()
    }

    /// Hand a broker-originated packet to the connection bound to `identifier`.
    pub async fn deliver(&self, identifier: &str, packet: T, timeout: Duration) -> Result<()> {
        let conn = self.lookup(identifier).ok_or_else(|| {
            debug!(identifier, "No live connection for broker message");
            ConduitError::ConnectionClosing
        })?;
        conn.write_from_broker(packet, timeout).await
    }

    fn read(&self) -> RwLockReadGuard<'_, HubMaps<T>> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HubMaps<T>> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Packet> Default for ConnectionHub<T> {
    fn default() -> Self {
        Self::new(Arc::new(DiscardPublisher))
    }
}

fn normalize(identifier: &str) -> String {
    identifier.to_ascii_uppercase()
}

impl<T: Packet> Registry<T> for ConnectionHub<T> {
    fn register(&self, index: u32, conn: Arc<Connection<T>>) {
        if self.write().conns.insert(index, conn).is_some() {
            warn!(conn = index, "Replaced a registered connection with the same index");
        }
    }

    fn bind(&self, identifier: &str, index: u32) {
        let mut maps = self.write();
        if !maps.conns.contains_key(&index) {
            debug!(conn = index, identifier, "Ignoring bind for unregistered connection");
            return;
        }
        if let Some(previous) = maps.identifiers.insert(normalize(identifier), index) {
            if previous != index {
                debug!(identifier, previous, conn = index, "Identifier moved to a new connection");
            }
        }
    }

    fn deregister(&self, index: u32, identifier: Option<&str>) {
        let mut maps = self.write();
        // only the close routine deregisters, so a live entry here is a newer
        // connection that reused the index after wraparound
        if maps.conns.get(&index).is_some_and(|conn| !conn.is_closed()) {
            warn!(conn = index, "Keeping live connection registered under a reused index");
            return;
        }
        maps.conns.remove(&index);
        if let Some(identifier) = identifier {
            let key = normalize(identifier);
            // a reconnected device may already own the identifier
            if maps.identifiers.get(&key) == Some(&index) {
                maps.identifiers.remove(&key);
            }
        }
    }

    fn lookup(&self, identifier: &str) -> Option<Arc<Connection<T>>> {
        let maps = self.read();
        let index = maps.identifiers.get(&normalize(identifier))?;
        maps.conns.get(index).cloned()
    }

    fn exists(&self, identifier: &str) -> bool {
        self.read().identifiers.contains_key(&normalize(identifier))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.publisher.publish(topic, payload)
    }
}

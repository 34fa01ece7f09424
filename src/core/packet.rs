/// An application-level unit of data.
///
/// The connection engine never looks inside a packet; it only needs the bytes
/// to put on the wire. `serialize` is expected to be a pure transformation.
///
/// A server carries a single packet type. Applications that exchange several
/// kinds of messages (device frames, broker commands) model them as an enum
/// implementing this trait.
pub trait Packet: Send + Sync + 'static {
    /// Encode the packet for transmission.
    fn serialize(&self) -> Vec<u8>;
}

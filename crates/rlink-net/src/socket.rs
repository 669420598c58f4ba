use async_trait::async_trait;
use bytes::Bytes;
use rlink_types::Address;

use crate::error::NetError;

/// An abstract connected stream carrying framed messages.
///
/// Implementations live in their own crates (e.g. `rlink-net-tcp`); tests
/// use in-memory mocks.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Send one complete frame.
    async fn send(&self, frame: Bytes) -> Result<(), NetError>;

    /// Receive one complete frame (header included).
    ///
    /// Stream transports must reassemble the frame from the header's size
    /// field. `NetError::ConnectionClosed` signals an orderly close.
    async fn recv(&self) -> Result<Bytes, NetError>;

    fn peer_addr(&self) -> Address;

    fn local_addr(&self) -> Address;

    async fn close(&self);
}

/// Accepts incoming connections on a bound address.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Socket: Socket;

    /// Wait for the next incoming connection.
    async fn accept(&self) -> Result<Self::Socket, NetError>;

    fn local_addr(&self) -> Address;
}

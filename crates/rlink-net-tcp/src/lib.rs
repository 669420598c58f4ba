//! TCP implementation of the `rlink-net` socket traits.
//!
//! A [`TcpSocket`] splits its stream into read and write halves, each behind
//! its own async mutex, so a send never waits on a pending receive. Receives
//! are frame-aware: the header is read first and its size field decides how
//! many payload bytes follow.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rlink_net::message::{MessageHeader, MESSAGE_HEADER_SIZE};
use rlink_net::{AsyncConnector, Listener, NetError, Socket};
use rlink_types::{Address, AddressType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

fn to_address(sa: SocketAddr) -> Address {
    Address::from_socket_addr(sa, AddressType::TCP)
}

pub struct TcpSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: Address,
    local_addr: Address,
}

impl TcpSocket {
    /// Wrap an already-connected stream.
    pub fn from_stream(stream: tokio::net::TcpStream) -> Result<Self, NetError> {
        stream.set_nodelay(true)?;
        let peer_addr = to_address(stream.peer_addr()?);
        let local_addr = to_address(stream.local_addr()?);
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            peer_addr,
            local_addr,
        })
    }

    async fn write_frame(&self, data: &[u8]) -> Result<(), NetError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&self) -> Result<Bytes, NetError> {
        let mut reader = self.reader.lock().await;

        let mut head = [0u8; MESSAGE_HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut head).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
                _ => e.into(),
            });
        }
        let header = MessageHeader::from_bytes(&head);
        header.check()?;

        let size = header.size as usize;
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + size);
        buf.put_slice(&head);
        buf.resize(MESSAGE_HEADER_SIZE + size, 0);
        reader.read_exact(&mut buf[MESSAGE_HEADER_SIZE..]).await?;
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, frame: Bytes) -> Result<(), NetError> {
        self.write_frame(&frame).await
    }

    async fn recv(&self) -> Result<Bytes, NetError> {
        self.read_frame().await
    }

    fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    fn local_addr(&self) -> Address {
        self.local_addr
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        // Already closed by the peer is fine.
        let _ = writer.shutdown().await;
    }
}

pub struct TcpListener {
    inner: tokio::net::TcpListener,
    local_addr: Address,
}

impl TcpListener {
    /// Bind to `addr`. Port 0 picks an ephemeral port; `local_addr()` reports
    /// the one actually bound.
    pub async fn bind(addr: Address) -> Result<Self, NetError> {
        let listener = tokio::net::TcpListener::bind(addr.to_socket_addr()).await?;
        let local_addr = to_address(listener.local_addr()?);
        tracing::info!(%local_addr, "TCP listener bound");

        Ok(Self {
            inner: listener,
            local_addr,
        })
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Socket = TcpSocket;

    async fn accept(&self) -> Result<TcpSocket, NetError> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::debug!(%peer, "accepted TCP connection");
        TcpSocket::from_stream(stream)
    }

    fn local_addr(&self) -> Address {
        self.local_addr
    }
}

/// Connect to a remote address.
pub async fn connect(addr: Address) -> Result<TcpSocket, NetError> {
    tracing::debug!(%addr, "connecting via TCP");
    let stream = tokio::net::TcpStream::connect(addr.to_socket_addr())
        .await
        .map_err(|e| NetError::ConnectFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    TcpSocket::from_stream(stream)
}

#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AsyncConnector<TcpSocket> for TcpConnector {
    async fn connect(&self, addr: Address) -> Result<TcpSocket, NetError> {
        crate::connect(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlink_net::message::frame;
    use rlink_net::transport::{recv_message, send_message};

    async fn pair() -> (TcpSocket, TcpSocket) {
        let listener = TcpListener::bind(Address::localhost(0)).await.unwrap();
        let addr = Listener::local_addr(&listener);
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = connect(addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = TcpListener::bind(Address::localhost(0)).await.unwrap();
        let local = Listener::local_addr(&listener);
        assert_eq!(local.octets(), [127, 0, 0, 1]);
        assert_ne!(local.port, 0);
    }

    #[tokio::test]
    async fn test_connect_and_accept_addresses() {
        let (client, server) = pair().await;
        assert_eq!(client.peer_addr(), server.local_addr());
        assert_eq!(server.peer_addr(), client.local_addr());
    }

    #[tokio::test]
    async fn test_frames_survive_coalescing() {
        let (client, server) = pair().await;

        // Two frames written back to back arrive as two frames.
        let mut both = frame(b"first").unwrap().to_vec();
        both.extend_from_slice(&frame(b"second").unwrap());
        client.send(Bytes::from(both)).await.unwrap();

        assert_eq!(recv_message(&server).await.unwrap().as_ref(), b"first");
        assert_eq!(recv_message(&server).await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_large_message() {
        let (client, server) = pair().await;
        let payload: Vec<u8> = (0..1_000_000).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let sender = tokio::spawn(async move {
            send_message(&client, &payload).await.unwrap();
            client
        });
        let got = recv_message(&server).await.unwrap();
        sender.await.unwrap();
        assert_eq!(got.as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_close_is_connection_closed() {
        let (client, server) = pair().await;
        client.close().await;
        assert!(matches!(server.recv().await, Err(NetError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_garbage_header_rejected() {
        let (client, server) = pair().await;
        client
            .send(Bytes::from_static(&[0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0]))
            .await
            .unwrap();
        assert!(matches!(server.recv().await, Err(NetError::InvalidMagic(0x78))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind(Address::localhost(0)).await.unwrap();
        let addr = Listener::local_addr(&listener);
        drop(listener);

        let err = TcpConnector::new().connect(addr).await.unwrap_err();
        assert!(matches!(err, NetError::ConnectFailed { .. }));
    }
}

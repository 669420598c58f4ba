use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rlink_types::Address;

use crate::error::NetError;
use crate::message::{frame, MessageHeader, MESSAGE_HEADER_SIZE};
use crate::socket::Socket;

/// Establishes new connections to a remote address.
#[async_trait]
pub trait AsyncConnector<S: Socket>: Send + Sync {
    async fn connect(&self, addr: Address) -> Result<S, NetError>;
}

/// Frame `payload` and send it.
pub async fn send_message<S: Socket + ?Sized>(socket: &S, payload: &[u8]) -> Result<(), NetError> {
    socket.send(frame(payload)?).await
}

/// Receive one frame, validate it, and return its payload.
pub async fn recv_message<S: Socket + ?Sized>(socket: &S) -> Result<Bytes, NetError> {
    let data = socket.recv().await?;
    if data.is_empty() {
        return Err(NetError::ConnectionClosed);
    }

    let header = MessageHeader::parse(&data)?;
    let end = MESSAGE_HEADER_SIZE + header.size as usize;
    if data.len() < end {
        return Err(NetError::IncompleteMessage {
            need: end,
            have: data.len(),
        });
    }

    let payload = data.slice(MESSAGE_HEADER_SIZE..end);
    header.validate(&payload)?;
    Ok(payload)
}

/// A cached connection. Request/reply exchanges on one connection are
/// serialized so replies cannot be matched to the wrong request.
///
/// An exchange that does not run to completion (cancelled by a timeout, or
/// failed half way) leaves the stream in an unknown position: its reply may
/// still arrive, or a frame may be half read. The connection is then marked
/// broken and every later exchange on it fails without touching the socket.
pub struct Connection<S: Socket> {
    socket: S,
    exchange: tokio::sync::Mutex<()>,
    broken: AtomicBool,
}

/// Holds the exchange lock and marks the connection broken when dropped
/// before `complete()`. Its `Drop` runs before the lock field is released.
struct Exchange<'a> {
    _lock: tokio::sync::MutexGuard<'a, ()>,
    broken: &'a AtomicBool,
    completed: bool,
}

impl Exchange<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.broken.store(true, Ordering::Release);
        }
    }
}

impl<S: Socket> Connection<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            exchange: tokio::sync::Mutex::new(()),
            broken: AtomicBool::new(false),
        }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Send one request payload and wait for the matching reply payload.
    pub async fn round_trip(&self, request: &[u8]) -> Result<Bytes, NetError> {
        let lock = self.exchange.lock().await;
        if self.is_broken() {
            return Err(NetError::ConnectionClosed);
        }
        let exchange = Exchange {
            _lock: lock,
            broken: &self.broken,
            completed: false,
        };

        send_message(&self.socket, request).await?;
        let reply = recv_message(&self.socket).await?;
        exchange.complete();
        Ok(reply)
    }
}

/// Cache of open connections keyed by remote address, one per address.
pub struct Transport<S: Socket> {
    connections: DashMap<Address, Arc<Connection<S>>>,
}

impl<S: Socket> Transport<S> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Retrieve an existing connection or establish a new one via `connector`.
    pub async fn get_or_connect(
        &self,
        addr: Address,
        connector: &(dyn AsyncConnector<S> + '_),
    ) -> Result<Arc<Connection<S>>, NetError> {
        if let Some(entry) = self.connections.get(&addr) {
            return Ok(Arc::clone(entry.value()));
        }

        let conn = Arc::new(Connection::new(connector.connect(addr).await?));
        // Two racing connects to the same peer: keep whichever landed first.
        let entry = self
            .connections
            .entry(addr)
            .or_insert_with(|| Arc::clone(&conn));
        Ok(Arc::clone(entry.value()))
    }

    /// Drop a cached connection, e.g. after an exchange on it failed.
    pub fn remove(&self, addr: &Address) -> Option<Arc<Connection<S>>> {
        self.connections.remove(addr).map(|(_, conn)| conn)
    }

    /// Drop the cached connection to `addr` only if it is broken, leaving a
    /// healthy replacement another caller may have opened in place.
    pub fn remove_broken(&self, addr: &Address) -> Option<Arc<Connection<S>>> {
        self.connections
            .remove_if(addr, |_, conn| conn.is_broken())
            .map(|(_, conn)| conn)
    }

    pub fn clear(&self) {
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<S: Socket> Default for Transport<S> {
    fn default() -> Self {
        Self::new()
    }
}

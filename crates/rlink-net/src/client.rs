use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rlink_types::Address;

use crate::error::NetError;
use crate::server::{decode_reply, encode_request};
use crate::service::RequestKind;
use crate::socket::Socket;
use crate::transport::{AsyncConnector, Transport};

/// One request/reply exchange with a remote service.
///
/// This is the seam higher layers program against: production code uses an
/// [`RpcClient`], tests may substitute anything that produces reply bytes.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send `request` to the method `kind` at `dest` and wait for the reply
    /// body. The whole exchange (connect, send, receive) is bounded by
    /// `timeout`. No retry is attempted.
    async fn send_request(
        &self,
        dest: Address,
        kind: RequestKind,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, NetError>;
}

/// RPC client with a per-peer connection cache.
///
/// A connection whose exchange fails or times out is marked broken and
/// evicted, so the next request starts from a fresh connection instead of
/// reading a stale reply. Callers already queued on the broken connection
/// fail with `ConnectionClosed`.
pub struct RpcClient<S: Socket, C: AsyncConnector<S>> {
    transport: Transport<S>,
    connector: C,
}

impl<S: Socket, C: AsyncConnector<S>> RpcClient<S, C> {
    pub fn new(connector: C) -> Self {
        Self {
            transport: Transport::new(),
            connector,
        }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    async fn call(&self, dest: Address, kind: RequestKind, request: &[u8]) -> Result<Bytes, NetError> {
        let conn = self.transport.get_or_connect(dest, &self.connector).await?;
        let envelope = encode_request(kind, request);
        match conn.round_trip(&envelope).await {
            Ok(reply) => decode_reply(reply),
            Err(e) => {
                self.evict(&dest).await;
                Err(e)
            }
        }
    }

    async fn evict(&self, dest: &Address) {
        if let Some(conn) = self.transport.remove_broken(dest) {
            conn.socket().close().await;
        }
    }
}

#[async_trait]
impl<S: Socket, C: AsyncConnector<S>> RequestSender for RpcClient<S, C> {
    async fn send_request(
        &self,
        dest: Address,
        kind: RequestKind,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, NetError> {
        tracing::debug!(%dest, %kind, len = request.len(), "sending request");
        match tokio::time::timeout(timeout, self.call(dest, kind, &request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%dest, %kind, ?timeout, "request timed out");
                self.evict(&dest).await;
                Err(NetError::Timeout)
            }
        }
    }
}

#[async_trait]
impl<T: RequestSender + ?Sized> RequestSender for Arc<T> {
    async fn send_request(
        &self,
        dest: Address,
        kind: RequestKind,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, NetError> {
        (**self).send_request(dest, kind, request, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{frame, MessageHeader, MESSAGE_HEADER_SIZE};
    use crate::server::{encode_reply, REQUEST_ENVELOPE_SIZE};
    use parking_lot::Mutex;
    use rlink_types::status_code::MemoryCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with a canned reply, or hangs when `silent`.
    struct MockSocket {
        sent: Mutex<Vec<Bytes>>,
        reply: Bytes,
        silent: bool,
    }

    #[async_trait]
    impl Socket for MockSocket {
        async fn send(&self, data: Bytes) -> Result<(), NetError> {
            self.sent.lock().push(data);
            Ok(())
        }
        async fn recv(&self) -> Result<Bytes, NetError> {
            if self.silent {
                std::future::pending::<()>().await;
            }
            Ok(frame(&self.reply)?)
        }
        fn peer_addr(&self) -> Address {
            Address::localhost(8080)
        }
        fn local_addr(&self) -> Address {
            Address::localhost(0)
        }
        async fn close(&self) {}
    }

    struct MockConnector {
        reply: Bytes,
        silent: bool,
        connects: AtomicUsize,
    }

    impl MockConnector {
        fn new(reply: Bytes, silent: bool) -> Self {
            Self {
                reply,
                silent,
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AsyncConnector<MockSocket> for MockConnector {
        async fn connect(&self, _addr: Address) -> Result<MockSocket, NetError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(MockSocket {
                sent: Mutex::new(Vec::new()),
                reply: self.reply.clone(),
                silent: self.silent,
            })
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl AsyncConnector<MockSocket> for RefusingConnector {
        async fn connect(&self, addr: Address) -> Result<MockSocket, NetError> {
            Err(NetError::ConnectFailed {
                addr: addr.to_string(),
                reason: "refused".into(),
            })
        }
    }

    const KIND: RequestKind = RequestKind::new(3, 1);
    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_send_request_ok() {
        let client = RpcClient::new(MockConnector::new(encode_reply(0, b"reply-data"), false));
        let dest = Address::localhost(8080);

        let resp = client
            .send_request(dest, KIND, Bytes::from_static(b"req"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(resp.as_ref(), b"reply-data");

        // The request went out framed, with the envelope in front.
        let conn = client.transport().get_or_connect(dest, &RefusingConnector).await.unwrap();
        let sent = conn.socket().sent.lock().clone();
        let hdr = MessageHeader::parse(&sent[0]).unwrap();
        let payload = &sent[0][MESSAGE_HEADER_SIZE..];
        assert!(hdr.validate(payload).is_ok());
        assert_eq!(&payload[..REQUEST_ENVELOPE_SIZE], &[3, 0, 1, 0]);
        assert_eq!(&payload[REQUEST_ENVELOPE_SIZE..], b"req");
    }

    #[tokio::test]
    async fn test_remote_error_keeps_connection() {
        let connector = MockConnector::new(encode_reply(MemoryCode::NOT_READY, b""), false);
        let client = RpcClient::new(connector);
        let dest = Address::localhost(8080);

        for _ in 0..2 {
            let err = client
                .send_request(dest, KIND, Bytes::new(), TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(err, NetError::Remote(ref s) if s.code() == MemoryCode::NOT_READY));
        }
        assert_eq!(client.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_evicts_connection() {
        let client = RpcClient::new(MockConnector::new(Bytes::new(), true));
        let dest = Address::localhost(8080);

        let started = std::time::Instant::now();
        let err = client
            .send_request(dest, KIND, Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(client.transport().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let client = RpcClient::new(RefusingConnector);
        let err = client
            .send_request(Address::localhost(1), KIND, Bytes::new(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::ConnectFailed { .. }));
        assert!(client.transport().is_empty());
    }
}

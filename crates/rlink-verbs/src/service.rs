//! The memory service: exposes the registry's fetch-attribute handler over
//! the RPC server.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rlink_net::{RequestKind, ServiceHandler};
use rlink_types::status_code::RPCCode;
use rlink_types::{make_error_msg, Status};

use crate::registry::RegistrationRegistry;

pub const MEMORY_SERVICE_ID: u16 = 3;
pub const FETCH_ATTRIBUTE_METHOD: u16 = 1;

pub const FETCH_ATTRIBUTE: RequestKind = RequestKind::new(MEMORY_SERVICE_ID, FETCH_ATTRIBUTE_METHOD);

pub struct MemoryService {
    registry: Arc<RegistrationRegistry>,
}

impl MemoryService {
    pub fn new(registry: Arc<RegistrationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RegistrationRegistry> {
        &self.registry
    }
}

#[async_trait]
impl ServiceHandler for MemoryService {
    fn service_id(&self) -> u16 {
        MEMORY_SERVICE_ID
    }

    fn service_name(&self) -> &str {
        "Memory"
    }

    async fn handle(&self, method_id: u16, request: Bytes) -> Result<Bytes, Status> {
        match method_id {
            FETCH_ATTRIBUTE_METHOD => Ok(self.registry.handle_fetch_request(&request)),
            other => make_error_msg(RPCCode::INVALID_METHOD_ID, format!("memory service method {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use rlink_net::{NetError, RequestSender, RpcClient, Server};
    use rlink_net_tcp::{TcpConnector, TcpListener, TcpSocket};
    use rlink_types::status_code::MemoryCode;
    use rlink_types::{Address, RegionId};

    use crate::access::AccessFlags;
    use crate::buf::LocalBuf;
    use crate::device::Device;
    use crate::driver::Driver;
    use crate::memory::MemoryAttr;
    use crate::soft::SoftDriver;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Node {
        registry: Arc<RegistrationRegistry>,
        device: Arc<Device>,
        server: Server,
        addr: Address,
    }

    async fn start_node(driver: &Arc<dyn Driver>, device: &str) -> Node {
        let device = Device::open(driver, device, 1).unwrap();
        let registry = Arc::new(RegistrationRegistry::new());
        let listener = TcpListener::bind(Address::localhost(0)).await.unwrap();
        let addr = rlink_net::Listener::local_addr(&listener);

        let mut server = Server::new();
        server.register_service(Arc::new(MemoryService::new(Arc::clone(&registry))));
        server.start(listener);
        Node {
            registry,
            device,
            server,
            addr,
        }
    }

    fn client() -> RpcClient<TcpSocket, TcpConnector> {
        RpcClient::new(TcpConnector::new())
    }

    /// Sends a canned reply regardless of the request.
    struct CannedSender(Bytes);

    #[async_trait]
    impl RequestSender for CannedSender {
        async fn send_request(
            &self,
            _dest: Address,
            _kind: RequestKind,
            _request: Bytes,
            _timeout: Duration,
        ) -> Result<Bytes, NetError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_fetch_remote_across_nodes() {
        let soft = SoftDriver::new(vec![
            crate::soft::SoftDeviceSpec::new("soft_0"),
            crate::soft::SoftDeviceSpec::new("soft_1"),
        ]);
        let driver: Arc<dyn Driver> = soft;
        let node_a = start_node(&driver, "soft_0").await;
        let node_b = start_node(&driver, "soft_1").await;

        let buf = Arc::new(LocalBuf::new(1024).unwrap());
        node_a
            .registry
            .register(RegionId(5), buf, &node_a.device, AccessFlags::default())
            .unwrap();
        let expected = node_a.registry.lookup(RegionId(5)).unwrap().attribute();

        let client = client();
        let fetched = RegistrationRegistry::fetch_remote(&client, RegionId(5), node_a.addr, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(fetched, expected);
        assert!(fetched.is_accessible());

        // Unregistered on the peer.
        let err = RegistrationRegistry::fetch_remote(&client, RegionId(6), node_a.addr, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::NOT_READY);

        // B has nothing registered either.
        let err = RegistrationRegistry::fetch_remote(&client, RegionId(5), node_b.addr, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::NOT_READY);
        assert!(node_b.server.is_running());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = Arc::new(RegistrationRegistry::new());
        let service = MemoryService::new(registry);
        let err = service.handle(9, Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::INVALID_METHOD_ID);
        assert_eq!(service.service_id(), MEMORY_SERVICE_ID);
    }

    #[tokio::test]
    async fn test_fetch_from_unreachable_peer() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = Instant::now();
        let err = RegistrationRegistry::fetch_remote(
            &client(),
            RegionId(5),
            Address::localhost(port),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(
            err.code() == RPCCode::CONNECT_FAILED || err.code() == RPCCode::TIMEOUT,
            "unexpected status {err}"
        );
    }

    #[tokio::test]
    async fn test_fetch_from_silent_peer_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let started = Instant::now();
        let err = RegistrationRegistry::fetch_remote(
            &client(),
            RegionId(5),
            Address::localhost(port),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        let elapsed = started.elapsed();
        assert_eq!(err.code(), RPCCode::TIMEOUT);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        silent.abort();
    }

    #[tokio::test]
    async fn test_malformed_replies() {
        let peer = Address::localhost(1);

        let err = RegistrationRegistry::fetch_remote(&CannedSender(Bytes::new()), RegionId(1), peer, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::BAD_REPLY);

        // Ready header but truncated payload.
        let mut reply = vec![0, 0, 0, 0, 12, 0, 0, 0];
        reply.extend_from_slice(&[1, 2, 3]);
        let err = RegistrationRegistry::fetch_remote(&CannedSender(Bytes::from(reply)), RegionId(1), peer, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::BAD_REPLY);

        // Unknown status value.
        let reply = Bytes::from_static(&[7, 0, 0, 0, 0, 0, 0, 0]);
        let err = RegistrationRegistry::fetch_remote(&CannedSender(reply), RegionId(1), peer, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::BAD_REPLY);

        // A well-formed reply decodes.
        let mut reply = vec![0, 0, 0, 0, 12, 0, 0, 0];
        reply.extend_from_slice(&0x4000u64.to_le_bytes());
        reply.extend_from_slice(&0x99u32.to_le_bytes());
        let attr = RegistrationRegistry::fetch_remote(&CannedSender(Bytes::from(reply)), RegionId(1), peer, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            attr,
            MemoryAttr {
                base_address: 0x4000,
                remote_token: 0x99
            }
        );
    }
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rlink_types::Status;

/// Identifies one RPC method: the service it belongs to and the method
/// within that service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKind {
    pub service_id: u16,
    pub method_id: u16,
}

impl RequestKind {
    pub const fn new(service_id: u16, method_id: u16) -> Self {
        Self {
            service_id,
            method_id,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_id, self.method_id)
    }
}

/// Implemented by RPC services hosted on a [`Server`](crate::Server).
///
/// A handler receives the raw request body and returns either the raw reply
/// body or a `Status`; the server turns the latter into a status-prefixed
/// error reply.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    fn service_id(&self) -> u16;

    /// Used in logs.
    fn service_name(&self) -> &str;

    async fn handle(&self, method_id: u16, request: Bytes) -> Result<Bytes, Status>;
}

/// Maps service ids to their handlers.
pub struct ServiceRegistry {
    services: DashMap<u16, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one with the same id.
    pub fn register(&self, service: Arc<dyn ServiceHandler>) {
        let id = service.service_id();
        tracing::debug!(service_id = id, name = service.service_name(), "service registered");
        self.services.insert(id, service);
    }

    /// Look up a handler. The returned `Arc` can be held across an await.
    pub fn get(&self, service_id: u16) -> Option<Arc<dyn ServiceHandler>> {
        self.services
            .get(&service_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn unregister(&self, service_id: u16) -> bool {
        self.services.remove(&service_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlink_types::status_code::StatusCode;

    struct EchoService;

    #[async_trait]
    impl ServiceHandler for EchoService {
        fn service_id(&self) -> u16 {
            1
        }
        fn service_name(&self) -> &str {
            "echo"
        }
        async fn handle(&self, _method_id: u16, request: Bytes) -> Result<Bytes, Status> {
            Ok(request)
        }
    }

    struct FailService(u16);

    #[async_trait]
    impl ServiceHandler for FailService {
        fn service_id(&self) -> u16 {
            self.0
        }
        fn service_name(&self) -> &str {
            "fail"
        }
        async fn handle(&self, _method_id: u16, _request: Bytes) -> Result<Bytes, Status> {
            Err(Status::new(StatusCode::UNKNOWN))
        }
    }

    #[test]
    fn test_request_kind_display() {
        assert_eq!(RequestKind::new(3, 1).to_string(), "3.1");
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(EchoService));
        registry.register(Arc::new(FailService(2)));

        assert_eq!(registry.get(1).unwrap().service_name(), "echo");
        assert!(registry.get(99).is_none());
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(1));
        assert!(registry.get(1).is_none());
        assert!(!registry.unregister(1));
    }

    #[test]
    fn test_register_replaces() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(EchoService));
        registry.register(Arc::new(FailService(1)));
        assert_eq!(registry.get(1).unwrap().service_name(), "fail");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_outlives_unregister() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(EchoService));
        let handler = registry.get(1).unwrap();
        registry.unregister(1);

        let resp = handler.handle(0, Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(resp.as_ref(), b"hi");
    }
}

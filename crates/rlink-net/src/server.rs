use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use rlink_types::status_code::{RPCCode, StatusCode};
use rlink_types::{status_code_t, Status};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::NetError;
use crate::service::{RequestKind, ServiceHandler, ServiceRegistry};
use crate::socket::{Listener, Socket};
use crate::transport::{recv_message, send_message};

/// Size of the request envelope: `[service_id u16 LE][method_id u16 LE]`.
pub const REQUEST_ENVELOPE_SIZE: usize = 4;

/// Size of the reply envelope: `[status u16 LE]`.
pub const REPLY_ENVELOPE_SIZE: usize = 2;

/// Hosts registered services on a `Listener`.
///
/// Each accepted connection runs in its own task and serves requests one at a
/// time. Every request gets exactly one reply whose first two bytes are the
/// status code; an OK reply carries the handler's body, an error reply carries
/// the status message.
pub struct Server {
    services: Arc<ServiceRegistry>,
    // Present while running; set to `true` on stop.
    shutdown: Option<watch::Sender<bool>>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_registry(ServiceRegistry::new())
    }

    pub fn with_registry(registry: ServiceRegistry) -> Self {
        Self {
            services: Arc::new(registry),
            shutdown: None,
        }
    }

    pub fn register_service(&self, service: Arc<dyn ServiceHandler>) {
        self.services.register(service);
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Start accepting connections in a background task that runs until
    /// `stop()` is called or the server is dropped.
    pub fn start<L: Listener>(&mut self, listener: L) {
        if self.shutdown.is_some() {
            tracing::warn!("server already running, ignoring duplicate start");
            return;
        }
        let (tx, shutdown) = watch::channel(false);
        self.shutdown = Some(tx);

        let services = Arc::clone(&self.services);
        let addr = listener.local_addr();
        tracing::info!(%addr, services = services.len(), "server starting");

        tokio::spawn(async move {
            Self::accept_loop(listener, services, shutdown).await;
            tracing::info!(%addr, "server accept loop exited");
        });
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tracing::info!("server stopping");
            tx.send_replace(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    async fn accept_loop<L: Listener>(
        listener: L,
        services: Arc<ServiceRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                // Also fires when the sender is gone.
                _ = shutdown.changed() => {
                    tracing::info!("server shutdown signal received");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok(socket) => {
                            let services = Arc::clone(&services);
                            let shutdown = shutdown.clone();
                            tasks.spawn(async move {
                                if let Err(e) = Self::handle_connection(socket, services, shutdown).await {
                                    tracing::debug!("connection handler finished: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                // Reap finished connection tasks so the set does not grow.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        tasks.shutdown().await;
    }

    async fn handle_connection<S: Socket>(
        socket: S,
        services: Arc<ServiceRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), NetError> {
        let peer = socket.peer_addr();
        tracing::debug!(%peer, "new connection");

        loop {
            let payload = tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    tracing::debug!(%peer, "connection shutdown");
                    return Err(NetError::ShuttingDown);
                }

                result = recv_message(&socket) => result?,
            };

            let reply = Self::dispatch(&services, payload).await;
            send_message(&socket, &reply).await?;
        }
    }

    /// Route one request payload to its handler and build the reply.
    async fn dispatch(services: &ServiceRegistry, payload: Bytes) -> Bytes {
        let Some(kind) = decode_request_kind(&payload) else {
            tracing::warn!(len = payload.len(), "request shorter than its envelope");
            return encode_error_reply(&Status::new(RPCCode::REQUEST_IS_EMPTY));
        };
        let body = payload.slice(REQUEST_ENVELOPE_SIZE..);

        let Some(handler) = services.get(kind.service_id) else {
            tracing::warn!(%kind, "service not found");
            return encode_error_reply(&Status::new(RPCCode::INVALID_SERVICE_ID));
        };

        tracing::debug!(
            %kind,
            service = handler.service_name(),
            body_len = body.len(),
            "dispatching request"
        );

        match handler.handle(kind.method_id, body).await {
            Ok(resp) => encode_reply(StatusCode::OK, &resp),
            Err(status) => {
                tracing::debug!(%kind, %status, "handler returned error");
                encode_error_reply(&status)
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the request envelope: `[service_id u16 LE][method_id u16 LE][body]`.
pub fn encode_request(kind: RequestKind, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_ENVELOPE_SIZE + body.len());
    buf.put_u16_le(kind.service_id);
    buf.put_u16_le(kind.method_id);
    buf.extend_from_slice(body);
    buf.freeze()
}

fn decode_request_kind(payload: &[u8]) -> Option<RequestKind> {
    if payload.len() < REQUEST_ENVELOPE_SIZE {
        return None;
    }
    Some(RequestKind::new(
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
    ))
}

/// Build a reply envelope: `[status u16 LE][body]`.
pub fn encode_reply(code: status_code_t, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REPLY_ENVELOPE_SIZE + body.len());
    buf.put_u16_le(code);
    buf.extend_from_slice(body);
    buf.freeze()
}

fn encode_error_reply(status: &Status) -> Bytes {
    // An error reply must never read as OK.
    let code = if status.is_ok() {
        StatusCode::UNKNOWN
    } else {
        status.code()
    };
    encode_reply(code, status.message().unwrap_or_default().as_bytes())
}

/// Split a reply into its body, or the remote status if it is an error.
pub fn decode_reply(reply: Bytes) -> Result<Bytes, NetError> {
    if reply.len() < REPLY_ENVELOPE_SIZE {
        return Err(NetError::IncompleteMessage {
            need: REPLY_ENVELOPE_SIZE,
            have: reply.len(),
        });
    }
    let code = u16::from_le_bytes([reply[0], reply[1]]);
    let body = reply.slice(REPLY_ENVELOPE_SIZE..);
    if code == StatusCode::OK {
        return Ok(body);
    }
    let status = if body.is_empty() {
        Status::new(code)
    } else {
        Status::with_message(code, String::from_utf8_lossy(&body))
    };
    Err(NetError::Remote(status))
}

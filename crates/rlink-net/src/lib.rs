//! Framed request/reply transport: message framing, the socket abstraction,
//! a connection cache, the service-hosting server and the RPC client.

pub mod client;
pub mod error;
pub mod message;
pub mod server;
pub mod service;
pub mod socket;
pub mod transport;

pub use client::{RequestSender, RpcClient};
pub use error::NetError;
pub use message::MessageHeader;
pub use server::Server;
pub use service::{RequestKind, ServiceHandler, ServiceRegistry};
pub use socket::{Listener, Socket};
pub use transport::{AsyncConnector, Connection, Transport};

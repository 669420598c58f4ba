//! Memory registration and reliable connections over RDMA verbs.
//!
//! Hardware is reached only through the [`Driver`] trait. [`soft::SoftDriver`]
//! implements it in process, so everything here runs and is tested without
//! an RDMA NIC.
//!
//! # Architecture
//!
//! - [`Device`]: one open port plus its protection domain, with a `ready()`
//!   predicate checked before anything is created against it.
//! - [`AccessFlags`]: what a registration permits.
//! - [`MemoryRegistration`]: one pinned [`LocalBuf`] and its address/token
//!   pair.
//! - [`RegistrationRegistry`]: the node-wide id → registration table, with
//!   the fetch-attribute request handler and client call.
//! - [`MemoryService`]: hosts the registry on an `rlink_net::Server`.
//! - [`ReliableConnection`]: one queue pair, its handshake state machine and
//!   its data path.

pub mod access;
pub mod buf;
pub mod config;
pub mod device;
pub mod driver;
pub mod memory;
pub mod qp;
pub mod registry;
pub mod service;
pub mod soft;

pub use access::{Access, AccessFlags};
pub use buf::LocalBuf;
pub use config::QpConfig;
pub use device::{Device, LinkLayer, PortInfo, PortState};
pub use driver::{CompletionOpcode, CompletionStatus, Driver, DriverError, WorkCompletion};
pub use memory::{LocalAttr, MemoryAttr, MemoryRegistration, ReplyHeader, ReplyStatus};
pub use qp::{
    AddressDescriptor, ConnectionIdentity, QpState, ReliableConnection, WorkDescriptor, WorkKind,
};
pub use registry::RegistrationRegistry;
pub use service::{MemoryService, FETCH_ATTRIBUTE, MEMORY_SERVICE_ID};

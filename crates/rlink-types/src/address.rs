use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Transport an [`Address`] is reachable through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum AddressType {
    TCP = 0,
    RDMA = 1,
    LOCAL = 3,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::TCP => write!(f, "TCP"),
            AddressType::RDMA => write!(f, "RDMA"),
            AddressType::LOCAL => write!(f, "LOCAL"),
        }
    }
}

/// A peer address: IPv4 (network byte order), port and transport type.
///
/// This is the destination handed to the request/reply transport when a node
/// asks a peer for one of its memory registrations.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IPv4 address in network byte order (big-endian).
    pub ip: u32,
    pub port: u16,
    pub addr_type: AddressType,
}

impl Address {
    pub fn new(ip: u32, port: u16, addr_type: AddressType) -> Self {
        Self {
            ip,
            port,
            addr_type,
        }
    }

    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16, addr_type: AddressType) -> Self {
        Self::new(u32::from_be_bytes([a, b, c, d]), port, addr_type)
    }

    /// `TCP://127.0.0.1:<port>`.
    pub fn localhost(port: u16) -> Self {
        Self::from_octets(127, 0, 0, 1, port, AddressType::TCP)
    }

    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    /// The socket address used to reach this peer over IP.
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.octets()), self.port))
    }

    /// Convert a socket address back, tagging it with `addr_type`.
    ///
    /// IPv4-mapped IPv6 addresses are unwrapped; any other IPv6 address maps
    /// to the unspecified IP since only IPv4 is representable.
    pub fn from_socket_addr(sa: SocketAddr, addr_type: AddressType) -> Self {
        let ip = match sa {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        Self::new(u32::from(ip), sa.port(), addr_type)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}://{}.{}.{}.{}:{}", self.addr_type, a, b, c, d, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parse an address string like `"TCP://192.168.1.1:8080"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (type_str, rest) = s.split_once("://").ok_or(AddressParseError::MissingScheme)?;

        let addr_type = match type_str {
            "TCP" => AddressType::TCP,
            "RDMA" => AddressType::RDMA,
            "LOCAL" => AddressType::LOCAL,
            _ => return Err(AddressParseError::UnknownType(type_str.to_string())),
        };

        let (ip_str, port_str) = rest.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        let ip: Ipv4Addr = ip_str.parse().map_err(|_| AddressParseError::InvalidIp)?;

        Ok(Address::new(u32::from(ip), port, addr_type))
    }
}

/// Errors when parsing an `Address` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing '://' scheme separator")]
    MissingScheme,
    #[error("unknown address type: {0}")]
    UnknownType(String),
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
    #[error("invalid IP address")]
    InvalidIp,
}

/// Status code type. Codes are grouped into ranges of one thousand per subsystem.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const DATA_CORRUPTION: status_code_t = 2;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const QUEUE_EMPTY: status_code_t = 5;
    pub const QUEUE_FULL: status_code_t = 6;
    pub const NOT_ENOUGH_MEMORY: status_code_t = 26;
    pub const INVALID_FORMAT: status_code_t = 33;
    pub const SERDE_INSUFFICIENT_LENGTH: status_code_t = 40;
    pub const SERDE_UNKNOWN_ENUM_VALUE: status_code_t = 43;
    pub const CONFIG_PARSE_ERROR: status_code_t = 71;
    pub const OS_ERROR: status_code_t = 72;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// RPC and transport status codes (2xxx).
pub mod RPCCode {
    use super::status_code_t;

    pub const INVALID_MESSAGE_TYPE: status_code_t = 2000;
    pub const REQUEST_IS_EMPTY: status_code_t = 2001;
    pub const VERIFY_REQUEST_FAILED: status_code_t = 2002;
    pub const VERIFY_RESPONSE_FAILED: status_code_t = 2003;
    pub const TIMEOUT: status_code_t = 2005;
    pub const INVALID_ADDR: status_code_t = 2006;
    pub const SEND_FAILED: status_code_t = 2007;
    pub const INVALID_SERVICE_ID: status_code_t = 2008;
    pub const INVALID_METHOD_ID: status_code_t = 2009;
    pub const SOCKET_ERROR: status_code_t = 2010;
    pub const LISTEN_FAILED: status_code_t = 2011;
    pub const REQUEST_REFUSED: status_code_t = 2012;
    pub const SOCKET_CLOSED: status_code_t = 2013;
    pub const CONNECT_FAILED: status_code_t = 2014;
    pub const IB_INIT_FAILED: status_code_t = 2015;
    pub const IB_DEVICE_NOT_FOUND: status_code_t = 2016;
    pub const IB_DEVICE_NOT_INITIALIZED: status_code_t = 2021;
    pub const IB_OPEN_PORT_FAILED: status_code_t = 2027;
}

/// Memory registration status codes (3xxx).
pub mod MemoryCode {
    use super::status_code_t;

    /// The region id is already present in the registry.
    pub const DUPLICATE_ID: status_code_t = 3000;
    /// The device refused to pin the buffer.
    pub const HARDWARE_FAILURE: status_code_t = 3001;
    /// The peer has no registration under the requested id.
    pub const NOT_READY: status_code_t = 3002;
    /// The peer answered a fetch with an empty or malformed reply.
    pub const BAD_REPLY: status_code_t = 3003;
}

/// Queue-pair status codes (4xxx).
pub mod QpCode {
    use super::status_code_t;

    pub const RESOURCE_ERROR: status_code_t = 4000;
    pub const HANDSHAKE_ERROR: status_code_t = 4001;
    pub const ALREADY_CONNECTED: status_code_t = 4002;
    pub const INVALID_STATE: status_code_t = 4003;
    pub const UNBOUND_MEMORY: status_code_t = 4004;
    pub const TRANSPORT_ERROR: status_code_t = 4005;
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    RPC = 2,
    Memory = 3,
    Qp = 4,
}

/// Determine the type/category of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        2000..=2999 => StatusCodeType::RPC,
        3000..=3999 => StatusCodeType::Memory,
        4000..=4999 => StatusCodeType::Qp,
        _ => StatusCodeType::Invalid,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::DATA_CORRUPTION => "DataCorruption",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::QUEUE_EMPTY => "QueueEmpty",
        StatusCode::QUEUE_FULL => "QueueFull",
        StatusCode::NOT_ENOUGH_MEMORY => "NotEnoughMemory",
        StatusCode::INVALID_FORMAT => "InvalidFormat",
        StatusCode::SERDE_INSUFFICIENT_LENGTH => "SerdeInsufficientLength",
        StatusCode::SERDE_UNKNOWN_ENUM_VALUE => "SerdeUnknownEnumValue",
        StatusCode::CONFIG_PARSE_ERROR => "ConfigParseError",
        StatusCode::OS_ERROR => "OSError",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        // RPC
        RPCCode::INVALID_MESSAGE_TYPE => "RPC::InvalidMessageType",
        RPCCode::REQUEST_IS_EMPTY => "RPC::RequestIsEmpty",
        RPCCode::VERIFY_REQUEST_FAILED => "RPC::VerifyRequestFailed",
        RPCCode::VERIFY_RESPONSE_FAILED => "RPC::VerifyResponseFailed",
        RPCCode::TIMEOUT => "RPC::Timeout",
        RPCCode::INVALID_ADDR => "RPC::InvalidAddr",
        RPCCode::SEND_FAILED => "RPC::SendFailed",
        RPCCode::INVALID_SERVICE_ID => "RPC::InvalidServiceID",
        RPCCode::INVALID_METHOD_ID => "RPC::InvalidMethodID",
        RPCCode::SOCKET_ERROR => "RPC::SocketError",
        RPCCode::LISTEN_FAILED => "RPC::ListenFailed",
        RPCCode::REQUEST_REFUSED => "RPC::RequestRefused",
        RPCCode::SOCKET_CLOSED => "RPC::SocketClosed",
        RPCCode::CONNECT_FAILED => "RPC::ConnectFailed",
        RPCCode::IB_INIT_FAILED => "RPC::IBInitFailed",
        RPCCode::IB_DEVICE_NOT_FOUND => "RPC::IBDeviceNotFound",
        RPCCode::IB_DEVICE_NOT_INITIALIZED => "RPC::IBDeviceNotInitialized",
        RPCCode::IB_OPEN_PORT_FAILED => "RPC::IBOpenPortFailed",

        // Memory
        MemoryCode::DUPLICATE_ID => "Memory::DuplicateId",
        MemoryCode::HARDWARE_FAILURE => "Memory::HardwareFailure",
        MemoryCode::NOT_READY => "Memory::NotReady",
        MemoryCode::BAD_REPLY => "Memory::BadReply",

        // Queue pair
        QpCode::RESOURCE_ERROR => "Qp::ResourceError",
        QpCode::HANDSHAKE_ERROR => "Qp::HandshakeError",
        QpCode::ALREADY_CONNECTED => "Qp::AlreadyConnected",
        QpCode::INVALID_STATE => "Qp::InvalidState",
        QpCode::UNBOUND_MEMORY => "Qp::UnboundMemory",
        QpCode::TRANSPORT_ERROR => "Qp::TransportError",

        _ => "Unknown",
    }
}

/// Whether a failure with this code is worth retrying by the caller.
///
/// The core never retries on its own; this only classifies.
pub fn is_transient(code: status_code_t) -> bool {
    matches!(
        code,
        RPCCode::TIMEOUT
            | RPCCode::SEND_FAILED
            | RPCCode::SOCKET_ERROR
            | RPCCode::SOCKET_CLOSED
            | RPCCode::CONNECT_FAILED
            | MemoryCode::NOT_READY
            | StatusCode::QUEUE_FULL
    )
}

use rlink_types::status_code::{RPCCode, StatusCode};
use rlink_types::Status;
use thiserror::Error;

/// Errors that can occur in the request/reply transport.
#[derive(Debug, Error)]
pub enum NetError {
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// No connection could be established to the peer.
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// The request/reply exchange did not finish in time.
    #[error("timeout")]
    Timeout,

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// An I/O error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The message checksum did not match the computed CRC32C.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The frame header does not carry the message magic byte.
    #[error("invalid message: bad magic (checksum low byte: {0:#04x})")]
    InvalidMagic(u8),

    /// The message size exceeds the maximum allowed.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Fewer bytes arrived than the frame header promised.
    #[error("incomplete message: need {need} bytes, have {have}")]
    IncompleteMessage { need: usize, have: usize },

    /// The server is shutting down and not accepting new requests.
    #[error("server shutting down")]
    ShuttingDown,

    /// The remote handler answered with a non-OK status.
    #[error("remote error: {0}")]
    Remote(Status),
}

impl NetError {
    /// The status code reported to callers for this transport failure.
    pub fn status_code(&self) -> u16 {
        match self {
            NetError::ConnectionClosed => RPCCode::SOCKET_CLOSED,
            NetError::ConnectFailed { .. } => RPCCode::CONNECT_FAILED,
            NetError::Timeout => RPCCode::TIMEOUT,
            NetError::SendFailed(_) => RPCCode::SEND_FAILED,
            NetError::Io(_) => RPCCode::SOCKET_ERROR,
            NetError::ChecksumMismatch { .. }
            | NetError::InvalidMagic(_)
            | NetError::MessageTooLarge { .. }
            | NetError::IncompleteMessage { .. } => RPCCode::VERIFY_RESPONSE_FAILED,
            NetError::ShuttingDown => RPCCode::REQUEST_REFUSED,
            NetError::Remote(status) if status.is_ok() => StatusCode::UNKNOWN,
            NetError::Remote(status) => status.code(),
        }
    }
}

impl From<NetError> for Status {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Remote(status) if !status.is_ok() => status,
            other => Status::with_message(other.status_code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlink_types::status_code::MemoryCode;

    #[test]
    fn test_display() {
        assert_eq!(NetError::ConnectionClosed.to_string(), "connection closed");

        let err = NetError::ChecksumMismatch {
            expected: 0xAABBCC86,
            actual: 0x11223386,
        };
        let s = err.to_string();
        assert!(s.contains("0xaabbcc86"));
        assert!(s.contains("0x11223386"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let net_err: NetError = io_err.into();
        assert!(matches!(net_err, NetError::Io(_)));
        assert_eq!(net_err.status_code(), RPCCode::SOCKET_ERROR);
    }

    #[test]
    fn test_into_status() {
        let status: Status = NetError::Timeout.into();
        assert_eq!(status.code(), RPCCode::TIMEOUT);

        let status: Status = NetError::ConnectFailed {
            addr: "TCP://127.0.0.1:1".into(),
            reason: "refused".into(),
        }
        .into();
        assert_eq!(status.code(), RPCCode::CONNECT_FAILED);
        assert!(status.message().unwrap().contains("refused"));

        let status: Status = NetError::InvalidMagic(0x78).into();
        assert_eq!(status.code(), RPCCode::VERIFY_RESPONSE_FAILED);
    }

    #[test]
    fn test_remote_status_passes_through() {
        let remote = Status::with_message(MemoryCode::NOT_READY, "id 9");
        let status: Status = NetError::Remote(remote.clone()).into();
        assert_eq!(status, remote);

        // A remote "error" that claims OK is a protocol violation.
        let status: Status = NetError::Remote(Status::new(StatusCode::OK)).into();
        assert_eq!(status.code(), StatusCode::UNKNOWN);
    }
}

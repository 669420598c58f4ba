use std::fmt;

use crate::status_code::{self, status_code_t, StatusCode, StatusCodeType};

/// Outcome of an rlink operation: a numeric code plus an optional detail.
///
/// Codes are grouped by range: common codes below 1000, RPC and device
/// errors in 2000, registry and fetch errors in 3000, queue-pair errors in
/// 4000. A `Status` travels unchanged from a remote node's reply envelope to
/// the local caller, so the code alone must identify the failure; the
/// message is only for people reading logs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

impl Status {
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    pub fn code(&self) -> status_code_t {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Range the code belongs to; `Invalid` for codes outside every range,
    /// e.g. a garbled status from a misbehaving peer.
    pub fn code_type(&self) -> StatusCodeType {
        status_code::type_of(self.code)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// A retry by the caller may succeed: the peer was slow or unreachable,
    /// the region was not registered yet, or a send queue was full. Nothing
    /// in rlink retries on its own.
    pub fn is_transient(&self) -> bool {
        status_code::is_transient(self.code)
    }

    /// `"Memory::NotReady(3002) region 7"`, or just `"Qp::InvalidState(4003)"`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::{MemoryCode, QpCode, RPCCode};

    #[test]
    fn test_status_ok() {
        let s = Status::new(StatusCode::OK);
        assert!(s.is_ok());
        assert!(s.message().is_none());
        assert_eq!(s.code_type(), StatusCodeType::Common);
        assert_eq!(s.describe(), "OK(0)");
    }

    #[test]
    fn test_registry_status() {
        let s = Status::with_message(MemoryCode::DUPLICATE_ID, "region 5");
        assert!(!s.is_ok());
        assert_eq!(s.code_type(), StatusCodeType::Memory);
        assert_eq!(s.message(), Some("region 5"));
        assert_eq!(s.to_string(), "Memory::DuplicateId(3000) region 5");
    }

    #[test]
    fn test_code_ranges() {
        assert_eq!(Status::new(RPCCode::TIMEOUT).code_type(), StatusCodeType::RPC);
        assert_eq!(Status::new(QpCode::INVALID_STATE).code_type(), StatusCodeType::Qp);
        assert_eq!(Status::new(1500).code_type(), StatusCodeType::Invalid);
        assert_eq!(Status::new(1500).describe(), "Unknown(1500)");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Status::new(RPCCode::TIMEOUT).is_transient());
        assert!(Status::new(RPCCode::CONNECT_FAILED).is_transient());
        assert!(Status::new(MemoryCode::NOT_READY).is_transient());
        assert!(!Status::new(MemoryCode::BAD_REPLY).is_transient());
        assert!(!Status::from(QpCode::INVALID_STATE).is_transient());
    }

    #[test]
    fn test_status_is_error() {
        let s = Status::new(QpCode::HANDSHAKE_ERROR);
        let e: &dyn std::error::Error = &s;
        assert!(e.to_string().contains("HandshakeError"));
    }
}

use crate::status::Status;
use crate::status_code::status_code_t;

/// The result type used throughout rlink, with `Status` as the error.
pub type Result<T> = std::result::Result<T, Status>;

/// Create an error result from a status code.
pub fn make_error<T>(code: status_code_t) -> Result<T> {
    Err(Status::new(code))
}

/// Create an error result from a status code and message.
pub fn make_error_msg<T>(code: status_code_t, msg: impl Into<String>) -> Result<T> {
    Err(Status::with_message(code, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::{MemoryCode, QpCode};

    #[test]
    fn test_make_error() {
        let r: Result<u32> = make_error(MemoryCode::NOT_READY);
        assert_eq!(r.unwrap_err().code(), 3002);
    }

    #[test]
    fn test_make_error_msg() {
        let r: Result<()> = make_error_msg(QpCode::UNBOUND_MEMORY, "remote attribute not bound");
        let err = r.unwrap_err();
        assert_eq!(err.code(), QpCode::UNBOUND_MEMORY);
        assert_eq!(err.message(), Some("remote attribute not bound"));
    }
}

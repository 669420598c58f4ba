//! Shared vocabulary types for rlink: status codes, `Status`, peer addresses
//! and strongly typed identifiers.

#[allow(non_snake_case)]
pub mod status_code;

pub mod result;
pub mod status;

#[macro_use]
pub mod strong_type;

pub mod address;
pub mod ids;

pub use address::{Address, AddressParseError, AddressType};
pub use ids::*;
pub use result::{make_error, make_error_msg, Result};
pub use status::Status;
pub use status_code::*;

//! Fixed-layout little-endian encoding used on every rlink wire.

mod wire;

pub use wire::{
    from_bytes_exact, is_null_reply, null_reply, to_bytes, WireDeserialize, WireError,
    WireSerialize, WireSize,
};

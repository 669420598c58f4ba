use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: need {need} bytes but only {have} remain")]
    InsufficientData { need: usize, have: usize },
    #[error("{extra} trailing bytes after a complete value")]
    TrailingBytes { extra: usize },
    #[error("invalid enum variant for {enum_name}: {value}")]
    InvalidEnumVariant {
        enum_name: &'static str,
        value: u64,
    },
}

/// Append the fixed little-endian layout of `self` to `buf`.
pub trait WireSerialize {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError>;
}

/// Decode a value starting at `*offset`, advancing the offset past it.
pub trait WireDeserialize: Sized {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError>;
}

/// Types whose encoding always occupies the same number of bytes.
pub trait WireSize {
    const WIRE_SIZE: usize;
}

fn read_bytes<'a>(buf: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
    let have = buf.len().saturating_sub(*offset);
    if have < n {
        return Err(WireError::InsufficientData { need: n, have });
    }
    let slice = &buf[*offset..*offset + n];
    *offset += n;
    Ok(slice)
}

/// Encode a value into a fresh buffer.
pub fn to_bytes<T: WireSerialize + ?Sized>(val: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    val.wire_serialize(&mut buf)?;
    Ok(buf)
}

/// Decode a value that must span the whole of `buf`.
pub fn from_bytes_exact<T: WireDeserialize>(buf: &[u8]) -> Result<T, WireError> {
    let mut offset = 0;
    let val = T::wire_deserialize(buf, &mut offset)?;
    if offset != buf.len() {
        return Err(WireError::TrailingBytes {
            extra: buf.len() - offset,
        });
    }
    Ok(val)
}

/// The reply a responder sends when it cannot make sense of a request: zero
/// bytes. Requesters treat an empty reply as "request rejected".
pub fn null_reply() -> bytes::Bytes {
    bytes::Bytes::new()
}

pub fn is_null_reply(buf: &[u8]) -> bool {
    buf.is_empty()
}

macro_rules! impl_wire_for_int {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl WireSerialize for $ty {
            fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
                let mut tmp = [0u8; $size];
                LittleEndian::$write(&mut tmp, *self);
                buf.extend_from_slice(&tmp);
                Ok(())
            }
        }

        impl WireDeserialize for $ty {
            fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
                let bytes = read_bytes(buf, offset, $size)?;
                Ok(LittleEndian::$read(bytes))
            }
        }

        impl WireSize for $ty {
            const WIRE_SIZE: usize = $size;
        }
    };
}

impl_wire_for_int!(u16, 2, read_u16, write_u16);
impl_wire_for_int!(u32, 4, read_u32, write_u32);
impl_wire_for_int!(u64, 8, read_u64, write_u64);

impl WireSerialize for u8 {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.push(*self);
        Ok(())
    }
}

impl WireDeserialize for u8 {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        Ok(read_bytes(buf, offset, 1)?[0])
    }
}

impl WireSize for u8 {
    const WIRE_SIZE: usize = 1;
}

// Fixed-size byte arrays (GIDs and the like) are written raw, without a
// length prefix.

impl<const N: usize> WireSerialize for [u8; N] {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> WireDeserialize for [u8; N] {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(read_bytes(buf, offset, N)?);
        Ok(out)
    }
}

impl<const N: usize> WireSize for [u8; N] {
    const WIRE_SIZE: usize = N;
}

use bytes::{Bytes, BytesMut};

use crate::error::NetError;

/// Size of the frame header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Magic byte stored in the low byte of every frame checksum.
pub const MESSAGE_MAGIC_NUM: u8 = 0x86;

/// Maximum allowed payload size (64 MiB). Control messages are tiny; anything
/// near this bound is a corrupt length field.
pub const MESSAGE_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Header prepended to every frame on the wire: 4-byte checksum followed by
/// 4-byte payload size, both little-endian.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub checksum: u32,
    pub size: u32,
}

impl MessageHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: calc_checksum(payload),
            size: payload.len() as u32,
        }
    }

    pub fn has_magic(&self) -> bool {
        (self.checksum & 0xFF) == MESSAGE_MAGIC_NUM as u32
    }

    pub fn from_bytes(data: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let checksum = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Self { checksum, size }
    }

    /// Parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, NetError> {
        match data.get(..MESSAGE_HEADER_SIZE) {
            Some(head) => {
                let mut raw = [0u8; MESSAGE_HEADER_SIZE];
                raw.copy_from_slice(head);
                Ok(Self::from_bytes(&raw))
            }
            None => Err(NetError::IncompleteMessage {
                need: MESSAGE_HEADER_SIZE,
                have: data.len(),
            }),
        }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Check the magic byte and the size bound. Readers call this before
    /// trusting `size` to allocate the payload buffer.
    pub fn check(&self) -> Result<(), NetError> {
        if !self.has_magic() {
            return Err(NetError::InvalidMagic((self.checksum & 0xFF) as u8));
        }
        let size = self.size as usize;
        if size > MESSAGE_MAX_SIZE {
            return Err(NetError::MessageTooLarge {
                size,
                max: MESSAGE_MAX_SIZE,
            });
        }
        Ok(())
    }

    /// Full validation of a received payload against this header.
    pub fn validate(&self, payload: &[u8]) -> Result<(), NetError> {
        self.check()?;
        let expected = calc_checksum(payload);
        if self.checksum != expected {
            return Err(NetError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            });
        }
        Ok(())
    }
}

/// CRC32C over `data` with the magic number in the low byte.
pub fn calc_checksum(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    (crc & !0xff) | (MESSAGE_MAGIC_NUM as u32)
}

/// Build a complete frame: header followed by `payload`.
pub fn frame(payload: &[u8]) -> Result<Bytes, NetError> {
    if payload.len() > MESSAGE_MAX_SIZE {
        return Err(NetError::MessageTooLarge {
            size: payload.len(),
            max: MESSAGE_MAX_SIZE,
        });
    }
    let header = MessageHeader::for_payload(payload);
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<MessageHeader>(), MESSAGE_HEADER_SIZE);
        let data = [0x86, 0x02, 0x03, 0x04, 0x05, 0x00, 0x00, 0x00];
        let hdr = MessageHeader::from_bytes(&data);
        assert_eq!(hdr.checksum, 0x04030286);
        assert_eq!(hdr.size, 5);
        assert!(hdr.has_magic());
        assert_eq!(hdr.to_bytes(), data);
    }

    #[test]
    fn test_parse_short_buffer() {
        assert!(matches!(
            MessageHeader::parse(&[1, 2, 3]),
            Err(NetError::IncompleteMessage { need: 8, have: 3 })
        ));
    }

    #[test]
    fn test_frame_validates() {
        let payload = b"region 5";
        let f = frame(payload).unwrap();
        assert_eq!(f.len(), MESSAGE_HEADER_SIZE + payload.len());

        let hdr = MessageHeader::parse(&f).unwrap();
        assert_eq!(hdr.size as usize, payload.len());
        assert!(hdr.validate(&f[MESSAGE_HEADER_SIZE..]).is_ok());
    }

    #[test]
    fn test_validate_bad_magic() {
        let hdr = MessageHeader {
            checksum: 0x1234_5678,
            size: 5,
        };
        assert!(matches!(
            hdr.validate(b"12345"),
            Err(NetError::InvalidMagic(0x78))
        ));
    }

    #[test]
    fn test_validate_bad_checksum() {
        let payload = b"some data";
        let mut hdr = MessageHeader::for_payload(payload);
        hdr.checksum ^= 0xFF00_0000;
        assert!(matches!(
            hdr.validate(payload),
            Err(NetError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_header_rejected_before_read() {
        let hdr = MessageHeader {
            checksum: MESSAGE_MAGIC_NUM as u32,
            size: (MESSAGE_MAX_SIZE + 1) as u32,
        };
        assert!(matches!(
            hdr.check(),
            Err(NetError::MessageTooLarge { .. })
        ));
        assert!(frame(&vec![0u8; MESSAGE_MAX_SIZE + 1]).is_err());
    }
}

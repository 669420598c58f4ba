//! Page-aligned local buffers that can be handed to the hardware.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use rlink_types::status_code::StatusCode;
use rlink_types::{make_error_msg, Result};

const PAGE_SIZE: usize = 4096;

/// A zero-initialized, page-aligned heap buffer with a stable address.
///
/// Memory registrations take the buffer behind an `Arc` and keep it alive
/// for as long as the hardware may touch it. All access goes through copy
/// methods; the hardware writes into the buffer concurrently, so no
/// reference into it is ever handed out.
pub struct LocalBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain bytes owned by this value; the copy-based
// accessors never create references into it.
unsafe impl Send for LocalBuf {}
unsafe impl Sync for LocalBuf {}

impl LocalBuf {
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return make_error_msg(StatusCode::INVALID_ARG, "zero-length buffer");
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .or_else(|e| make_error_msg(StatusCode::INVALID_ARG, e.to_string()))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self { ptr, layout }),
            None => make_error_msg(StatusCode::NOT_ENOUGH_MEMORY, format!("allocating {len} bytes")),
        }
    }

    /// Base address, as handed to the hardware.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => make_error_msg(
                StatusCode::INVALID_ARG,
                format!("range {offset}+{len} outside buffer of {} bytes", self.len()),
            ),
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked above; `data` cannot alias the buffer since
        // no reference into it exists.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len())
        };
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Store `value` at `offset` in native byte order.
    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_ne_bytes())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let bytes = self.read_bytes(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_ne_bytes(raw))
    }
}

impl Drop for LocalBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for LocalBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBuf")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroed() {
        let buf = LocalBuf::new(100).unwrap();
        assert_eq!(buf.addr() % PAGE_SIZE as u64, 0);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.read_bytes(0, 100).unwrap(), vec![0u8; 100]);
    }

    #[test]
    fn test_read_write() {
        let buf = LocalBuf::new(64).unwrap();
        buf.write_u64(8, 73).unwrap();
        assert_eq!(buf.read_u64(8).unwrap(), 73);
        buf.write_bytes(60, b"tail").unwrap();
        assert_eq!(buf.read_bytes(60, 4).unwrap(), b"tail");
    }

    #[test]
    fn test_bounds() {
        let buf = LocalBuf::new(16).unwrap();
        assert_eq!(
            buf.write_u64(12, 1).unwrap_err().code(),
            StatusCode::INVALID_ARG
        );
        assert!(buf.read_bytes(usize::MAX, 2).is_err());
        assert_eq!(
            LocalBuf::new(0).unwrap_err().code(),
            StatusCode::INVALID_ARG
        );
    }
}

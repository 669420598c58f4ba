//! Memory registrations and the attributes peers use to reach them.

use std::fmt;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rlink_serde::{WireDeserialize, WireError, WireSerialize, WireSize};

use crate::access::AccessFlags;
use crate::buf::LocalBuf;
use crate::device::Device;
use crate::driver::{MrGuard, PinnedRegion};

/// What a peer needs to target a registration: its base address and remote
/// token. A token of 0 means the region is not remotely accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryAttr {
    pub base_address: u64,
    pub remote_token: u32,
}

impl MemoryAttr {
    pub fn is_accessible(&self) -> bool {
        self.remote_token != 0
    }
}

impl WireSize for MemoryAttr {
    const WIRE_SIZE: usize = 12;
}

impl WireSerialize for MemoryAttr {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        self.base_address.wire_serialize(buf)?;
        self.remote_token.wire_serialize(buf)
    }
}

impl WireDeserialize for MemoryAttr {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        Ok(Self {
            base_address: u64::wire_deserialize(buf, offset)?,
            remote_token: u32::wire_deserialize(buf, offset)?,
        })
    }
}

/// The local side of a registration, bound to a connection as the source or
/// destination of its operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalAttr {
    pub address: u64,
    pub length: u64,
    pub local_token: u32,
}

impl LocalAttr {
    pub fn contains(&self, address: u64, len: u64) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.address && end <= self.address + self.length,
            None => false,
        }
    }
}

/// One buffer pinned against a device.
///
/// Created invalid (no pinning, tokens 0) when the device is not ready or the
/// driver refuses the registration. A valid registration is deregistered
/// exactly once, when it is dropped, and before its buffer can be freed.
pub struct MemoryRegistration {
    // Field order is drop order: unpin, then release the buffer.
    pinned: Option<PinnedRegion>,
    buf: Arc<LocalBuf>,
    device: Arc<Device>,
    flags: AccessFlags,
}

impl MemoryRegistration {
    pub fn create(buf: Arc<LocalBuf>, device: &Arc<Device>, flags: AccessFlags) -> Self {
        let pinned = if device.ready() {
            // SAFETY: the registration owns a reference to `buf`, and `pinned`
            // is dropped (deregistered) before that reference.
            let result = unsafe { MrGuard::register(device.pd(), buf.addr(), buf.len(), flags.access()) };
            match result {
                Ok(pinned) => {
                    tracing::debug!(
                        device = device.name(),
                        addr = buf.addr(),
                        len = buf.len(),
                        rkey = pinned.rkey,
                        "memory pinned"
                    );
                    Some(pinned)
                }
                Err(e) => {
                    tracing::warn!(device = device.name(), len = buf.len(), error = %e, "memory registration failed");
                    None
                }
            }
        } else {
            None
        };

        Self {
            pinned,
            buf,
            device: Arc::clone(device),
            flags,
        }
    }

    pub fn valid(&self) -> bool {
        self.pinned.is_some()
    }

    pub fn attribute(&self) -> MemoryAttr {
        MemoryAttr {
            base_address: self.buf.addr(),
            remote_token: self.pinned.as_ref().map_or(0, |p| p.rkey),
        }
    }

    pub fn local_attribute(&self) -> LocalAttr {
        LocalAttr {
            address: self.buf.addr(),
            length: self.buf.len() as u64,
            local_token: self.pinned.as_ref().map_or(0, |p| p.lkey),
        }
    }

    pub fn buffer(&self) -> &Arc<LocalBuf> {
        &self.buf
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }
}

impl fmt::Debug for MemoryRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegistration")
            .field("device", &self.device.name())
            .field("buf", &self.buf)
            .field("valid", &self.valid())
            .field("flags", &self.flags)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ReplyStatus {
    Ready = 0,
    NotReady = 1,
}

/// Envelope of every memory-service reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub status: ReplyStatus,
    pub payload_length: u32,
}

impl ReplyHeader {
    pub fn ready(payload_length: u32) -> Self {
        Self {
            status: ReplyStatus::Ready,
            payload_length,
        }
    }

    pub fn not_ready() -> Self {
        Self {
            status: ReplyStatus::NotReady,
            payload_length: 0,
        }
    }
}

impl WireSize for ReplyHeader {
    const WIRE_SIZE: usize = 8;
}

impl WireSerialize for ReplyHeader {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        u32::from(self.status).wire_serialize(buf)?;
        self.payload_length.wire_serialize(buf)
    }
}

impl WireDeserialize for ReplyHeader {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let raw = u32::wire_deserialize(buf, offset)?;
        let status = ReplyStatus::try_from(raw).map_err(|_| WireError::InvalidEnumVariant {
            enum_name: "ReplyStatus",
            value: raw as u64,
        })?;
        Ok(Self {
            status,
            payload_length: u32::wire_deserialize(buf, offset)?,
        })
    }
}

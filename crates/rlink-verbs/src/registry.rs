//! The node-wide table of memory registrations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rlink_net::RequestSender;
use rlink_serde::{from_bytes_exact, is_null_reply, null_reply, to_bytes, WireDeserialize, WireSize};
use rlink_types::status_code::MemoryCode;
use rlink_types::{make_error_msg, Address, RegionId, Result, Status};

use crate::access::AccessFlags;
use crate::buf::LocalBuf;
use crate::device::Device;
use crate::memory::{MemoryAttr, MemoryRegistration, ReplyHeader, ReplyStatus};
use crate::service::FETCH_ATTRIBUTE;

/// Maps region ids to the registrations this node owns.
///
/// Every read and write goes through one lock, held only for the duration of
/// each call. Shared between the RPC service and local users by `Arc`;
/// dropping the last reference releases every remaining registration.
#[derive(Default)]
pub struct RegistrationRegistry {
    entries: Mutex<HashMap<RegionId, Arc<MemoryRegistration>>>,
}

impl RegistrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `buf` on `device` and publish it under `id`.
    ///
    /// # Panics
    /// If `device` is not ready. Callers check `Device::ready()` first.
    pub fn register(
        &self,
        id: RegionId,
        buf: Arc<LocalBuf>,
        device: &Arc<Device>,
        flags: AccessFlags,
    ) -> Result<()> {
        assert!(
            device.ready(),
            "registering {id:?} on device {} which is not ready",
            device.name()
        );

        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return make_error_msg(MemoryCode::DUPLICATE_ID, format!("region {id} already registered"));
        }

        let registration = MemoryRegistration::create(buf, device, flags);
        if !registration.valid() {
            tracing::warn!(%id, device = device.name(), "hardware refused memory registration");
            return make_error_msg(MemoryCode::HARDWARE_FAILURE, format!("pinning region {id} failed"));
        }

        tracing::debug!(%id, attr = ?registration.attribute(), "region registered");
        entries.insert(id, Arc::new(registration));
        Ok(())
    }

    /// Remove `id`. A no-op if it is absent. Returns whether an entry existed.
    ///
    /// The pinning is released once the last outstanding `lookup` handle is
    /// dropped.
    pub fn deregister(&self, id: RegionId) -> bool {
        let removed = self.entries.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(%id, "region deregistered");
        }
        removed.is_some()
    }

    pub fn lookup(&self, id: RegionId) -> Option<Arc<MemoryRegistration>> {
        self.entries.lock().get(&id).cloned()
    }

    /// Wire bytes of `id`'s attribute, or empty if `id` is not registered.
    pub fn serialize_attribute(&self, id: RegionId) -> Vec<u8> {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(reg) => to_bytes(&reg.attribute()).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn ids(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.entries.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Answer a fetch-attribute request.
    ///
    /// The request must be exactly one little-endian `u64` region id;
    /// anything else gets the null reply. Otherwise the reply is a
    /// [`ReplyHeader`] followed by the attribute when the id is registered.
    pub fn handle_fetch_request(&self, request: &[u8]) -> Bytes {
        let Ok(raw) = from_bytes_exact::<u64>(request) else {
            tracing::debug!(len = request.len(), "malformed fetch request");
            return null_reply();
        };
        let id = RegionId(raw);

        let attr = self.serialize_attribute(id);
        let header = if attr.is_empty() {
            ReplyHeader::not_ready()
        } else {
            ReplyHeader::ready(attr.len() as u32)
        };
        tracing::debug!(%id, status = ?header.status, "fetch request");

        let mut reply = Vec::with_capacity(ReplyHeader::WIRE_SIZE + attr.len());
        if to_bytes(&header).map(|h| reply.extend_from_slice(&h)).is_err() {
            return null_reply();
        }
        reply.extend_from_slice(&attr);
        Bytes::from(reply)
    }

    /// Ask `peer` for the attribute of its region `id`.
    ///
    /// One request/reply exchange bounded by `timeout`, never retried.
    /// Transport failures carry their RPC status code; a peer that does not
    /// have `id` yields `NOT_READY`; anything unparseable yields `BAD_REPLY`.
    pub async fn fetch_remote(
        sender: &dyn RequestSender,
        id: RegionId,
        peer: Address,
        timeout: Duration,
    ) -> Result<MemoryAttr> {
        let request = Bytes::copy_from_slice(&id.get().to_le_bytes());
        let reply = sender
            .send_request(peer, FETCH_ATTRIBUTE, request, timeout)
            .await
            .map_err(Status::from)?;
        if is_null_reply(&reply) {
            return make_error_msg(MemoryCode::BAD_REPLY, format!("{peer} rejected the request"));
        }

        let bad_reply = |what: String| Status::with_message(MemoryCode::BAD_REPLY, what);
        let mut offset = 0;
        let header = ReplyHeader::wire_deserialize(&reply, &mut offset)
            .map_err(|e| bad_reply(format!("reply header from {peer}: {e}")))?;
        match header.status {
            ReplyStatus::NotReady => {
                make_error_msg(MemoryCode::NOT_READY, format!("region {id} not registered at {peer}"))
            }
            ReplyStatus::Ready => {
                let payload = &reply[offset..];
                if header.payload_length as usize != MemoryAttr::WIRE_SIZE
                    || payload.len() != MemoryAttr::WIRE_SIZE
                {
                    return Err(bad_reply(format!(
                        "payload of {} bytes (header says {}) from {peer}",
                        payload.len(),
                        header.payload_length
                    )));
                }
                let attr: MemoryAttr =
                    from_bytes_exact(payload).map_err(|e| bad_reply(e.to_string()))?;
                tracing::debug!(%id, %peer, ?attr, "fetched remote attribute");
                Ok(attr)
            }
        }
    }
}

impl std::fmt::Debug for RegistrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PortState;
    use crate::driver::Driver;
    use crate::soft::{SoftDeviceSpec, SoftDriver};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn setup() -> (Arc<SoftDriver>, Arc<Device>) {
        let soft = SoftDriver::new(vec![
            SoftDeviceSpec::new("soft_0").max_mr_size(1 << 20),
            SoftDeviceSpec::new("soft_1").port_state(1, PortState::Down),
        ]);
        let driver: Arc<dyn Driver> = soft.clone();
        let dev = Device::open(&driver, "soft_0", 1).unwrap();
        (soft, dev)
    }

    fn buf(len: usize) -> Arc<LocalBuf> {
        Arc::new(LocalBuf::new(len).unwrap())
    }

    #[test]
    fn test_register_lookup_deregister() {
        let (soft, dev) = setup();
        let registry = RegistrationRegistry::new();

        registry.register(RegionId(1), buf(1024), &dev, AccessFlags::default()).unwrap();
        let reg = registry.lookup(RegionId(1)).unwrap();
        assert_ne!(reg.attribute().remote_token, 0);

        assert!(registry.deregister(RegionId(1)));
        assert!(registry.lookup(RegionId(1)).is_none());
        assert!(!registry.deregister(RegionId(1)));

        // The handle keeps the pinning alive past deregistration.
        assert_eq!(soft.stats().mrs, 1);
        drop(reg);
        assert_eq!(soft.stats().mrs, 0);
    }

    #[test]
    fn test_duplicate_id_keeps_first() {
        let (_soft, dev) = setup();
        let registry = RegistrationRegistry::new();
        let first = buf(64);

        registry.register(RegionId(7), Arc::clone(&first), &dev, AccessFlags::default()).unwrap();
        let before = registry.lookup(RegionId(7)).unwrap().attribute();

        let err = registry
            .register(RegionId(7), buf(64), &dev, AccessFlags::default())
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::DUPLICATE_ID);

        let after = registry.lookup(RegionId(7)).unwrap();
        assert!(after.valid());
        assert_eq!(after.attribute(), before);
        assert_eq!(after.attribute().base_address, first.addr());

        // Peers still fetch the original attribute.
        let reply = registry.handle_fetch_request(&7u64.to_le_bytes());
        let mut offset = 0;
        let header = ReplyHeader::wire_deserialize(&reply, &mut offset).unwrap();
        assert_eq!(header, ReplyHeader::ready(MemoryAttr::WIRE_SIZE as u32));
        let fetched: MemoryAttr = from_bytes_exact(&reply[offset..]).unwrap();
        assert_eq!(fetched, before);
    }

    #[test]
    fn test_not_ready_device_panics_without_entry() {
        let (soft, _dev) = setup();
        let driver: Arc<dyn Driver> = soft.clone();
        let down = Device::open(&driver, "soft_1", 1).unwrap();
        let registry = RegistrationRegistry::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            registry.register(RegionId(1), buf(64), &down, AccessFlags::default())
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert_eq!(soft.stats().mrs, 0);
    }

    #[test]
    fn test_hardware_failure_leaves_no_entry() {
        let (_soft, dev) = setup();
        let registry = RegistrationRegistry::new();
        let err = registry
            .register(RegionId(2), buf(2 << 20), &dev, AccessFlags::default())
            .unwrap_err();
        assert_eq!(err.code(), MemoryCode::HARDWARE_FAILURE);
        assert!(registry.lookup(RegionId(2)).is_none());
    }

    #[test]
    fn test_serialize_attribute() {
        let (_soft, dev) = setup();
        let registry = RegistrationRegistry::new();
        assert!(registry.serialize_attribute(RegionId(3)).is_empty());

        registry.register(RegionId(3), buf(128), &dev, AccessFlags::default()).unwrap();
        let bytes = registry.serialize_attribute(RegionId(3));
        let attr: MemoryAttr = from_bytes_exact(&bytes).unwrap();
        assert_eq!(attr, registry.lookup(RegionId(3)).unwrap().attribute());
    }

    #[test]
    fn test_fetch_request_handling() {
        let (_soft, dev) = setup();
        let registry = RegistrationRegistry::new();
        registry.register(RegionId(5), buf(256), &dev, AccessFlags::default()).unwrap();

        // Wrong length: null reply.
        assert!(is_null_reply(&registry.handle_fetch_request(&[5, 0, 0, 0])));
        assert!(is_null_reply(&registry.handle_fetch_request(&[0u8; 9])));
        assert!(is_null_reply(&registry.handle_fetch_request(&[])));

        let reply = registry.handle_fetch_request(&5u64.to_le_bytes());
        assert_eq!(reply.len(), ReplyHeader::WIRE_SIZE + MemoryAttr::WIRE_SIZE);
        let mut offset = 0;
        let header = ReplyHeader::wire_deserialize(&reply, &mut offset).unwrap();
        assert_eq!(header, ReplyHeader::ready(12));
        let attr: MemoryAttr = from_bytes_exact(&reply[offset..]).unwrap();
        assert_eq!(attr, registry.lookup(RegionId(5)).unwrap().attribute());

        let reply = registry.handle_fetch_request(&6u64.to_le_bytes());
        assert_eq!(reply.len(), ReplyHeader::WIRE_SIZE);
        let header: ReplyHeader = from_bytes_exact(&reply).unwrap();
        assert_eq!(header, ReplyHeader::not_ready());
    }

    #[test]
    fn test_concurrent_register_deregister() {
        let (soft, dev) = setup();
        let registry = Arc::new(RegistrationRegistry::new());

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let dev = Arc::clone(&dev);
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let id = RegionId(t * 1000 + i);
                        registry.register(id, buf(64), &dev, AccessFlags::default()).unwrap();
                        assert!(registry.lookup(id).unwrap().valid());
                        if i % 2 == 0 {
                            assert!(registry.deregister(id));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 25);
        assert_eq!(soft.stats().mrs, 8 * 25);
        drop(registry);
        assert_eq!(soft.stats().mrs, 0);
    }
}

//! Device handles: one interface port plus its protection domain.

use std::fmt;
use std::sync::Arc;

use rlink_types::status_code::RPCCode;
use rlink_types::{make_error_msg, Result, Status};
use serde::{Deserialize, Serialize};

use crate::driver::{ContextGuard, Driver, PdGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkLayer {
    Infiniband,
    /// RoCE.
    Ethernet,
}

impl fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkLayer::Infiniband => write!(f, "INFINIBAND"),
            LinkLayer::Ethernet => write!(f, "ETHERNET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Down => write!(f, "DOWN"),
            PortState::Init => write!(f, "INIT"),
            PortState::Armed => write!(f, "ARMED"),
            PortState::Active => write!(f, "ACTIVE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_num: u8,
    pub link_layer: LinkLayer,
    pub state: PortState,
    /// Local id; only meaningful on InfiniBand.
    pub lid: u16,
    pub gid: [u8; 16],
}

impl PortInfo {
    pub fn is_roce(&self) -> bool {
        self.link_layer == LinkLayer::Ethernet
    }

    pub fn is_active(&self) -> bool {
        self.state == PortState::Active
    }
}

/// An open device port and its protection domain.
///
/// Shared by `Arc`: every registration and connection created against a
/// device holds a clone, so the device outlives them all.
pub struct Device {
    // Field order is drop order: the PD goes before its context.
    pd: PdGuard,
    ctx: ContextGuard,
    name: String,
    port: PortInfo,
    ready: bool,
}

impl Device {
    /// Names of every device the driver can open.
    pub fn list(driver: &Arc<dyn Driver>) -> Vec<String> {
        driver.device_names()
    }

    /// Open `name`, query `port` and allocate a protection domain.
    ///
    /// Opening succeeds for an existing device whose port is down; such a
    /// device reports `ready() == false` and dependents refuse to use it.
    pub fn open(driver: &Arc<dyn Driver>, name: &str, port: u8) -> Result<Arc<Device>> {
        if !driver.device_names().iter().any(|n| n == name) {
            return make_error_msg(RPCCode::IB_DEVICE_NOT_FOUND, name);
        }

        let ctx = ContextGuard::open(driver, name)
            .map_err(|e| Status::with_message(RPCCode::IB_INIT_FAILED, e.to_string()))?;
        let attr = driver
            .query_port(ctx.raw(), port)
            .map_err(|e| Status::with_message(RPCCode::IB_OPEN_PORT_FAILED, e.to_string()))?;
        let pd = PdGuard::alloc(&ctx)
            .map_err(|e| Status::with_message(RPCCode::IB_INIT_FAILED, e.to_string()))?;

        let port = PortInfo {
            port_num: port,
            link_layer: attr.link_layer,
            state: attr.state,
            lid: attr.lid,
            gid: attr.gid,
        };
        let ready = port.is_active();
        if ready {
            tracing::info!(
                device = name,
                port = port.port_num,
                link_layer = %port.link_layer,
                lid = port.lid,
                driver = driver.name(),
                "device opened"
            );
        } else {
            tracing::warn!(device = name, port = port.port_num, state = %port.state, "device port not active");
        }

        Ok(Arc::new(Device {
            pd,
            ctx,
            name: name.to_string(),
            port,
            ready,
        }))
    }

    /// Open the first device the driver lists.
    pub fn open_first(driver: &Arc<dyn Driver>, port: u8) -> Result<Arc<Device>> {
        match driver.device_names().first() {
            Some(name) => Self::open(driver, name, port),
            None => make_error_msg(RPCCode::IB_DEVICE_NOT_FOUND, "no devices"),
        }
    }

    /// Whether dependent resources may be created. Fixed at open time.
    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &PortInfo {
        &self.port
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.ctx.driver()
    }

    pub(crate) fn context(&self) -> &ContextGuard {
        &self.ctx
    }

    pub(crate) fn pd(&self) -> &PdGuard {
        &self.pd
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("port", &self.port.port_num)
            .field("state", &self.port.state)
            .field("ready", &self.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{SoftDeviceSpec, SoftDriver};

    fn driver() -> Arc<dyn Driver> {
        SoftDriver::new(vec![
            SoftDeviceSpec::new("soft_0"),
            SoftDeviceSpec::new("soft_1")
                .link_layer(LinkLayer::Ethernet)
                .port_state(1, PortState::Down),
        ])
    }

    #[test]
    fn test_list_and_open() {
        let driver = driver();
        assert_eq!(Device::list(&driver), vec!["soft_0", "soft_1"]);

        let dev = Device::open(&driver, "soft_0", 1).unwrap();
        assert!(dev.ready());
        assert_eq!(dev.name(), "soft_0");
        assert!(!dev.port().is_roce());
        assert_ne!(dev.port().lid, 0);

        let first = Device::open_first(&driver, 1).unwrap();
        assert_eq!(first.name(), "soft_0");
    }

    #[test]
    fn test_down_port_is_not_ready() {
        let dev = Device::open(&driver(), "soft_1", 1).unwrap();
        assert!(!dev.ready());
        assert!(dev.port().is_roce());
        assert_eq!(dev.port().state, PortState::Down);
    }

    #[test]
    fn test_open_errors() {
        let driver = driver();
        let err = Device::open(&driver, "mlx5_9", 1).unwrap_err();
        assert_eq!(err.code(), RPCCode::IB_DEVICE_NOT_FOUND);

        let err = Device::open(&driver, "soft_0", 7).unwrap_err();
        assert_eq!(err.code(), RPCCode::IB_OPEN_PORT_FAILED);

        let empty: Arc<dyn Driver> = SoftDriver::new(Vec::new());
        assert_eq!(
            Device::open_first(&empty, 1).unwrap_err().code(),
            RPCCode::IB_DEVICE_NOT_FOUND
        );
    }

    #[test]
    fn test_drop_releases_handles() {
        let soft = SoftDriver::new(vec![SoftDeviceSpec::new("soft_0")]);
        let driver: Arc<dyn Driver> = soft.clone();
        let dev = Device::open(&driver, "soft_0", 1).unwrap();
        assert_eq!(soft.stats().contexts, 1);
        assert_eq!(soft.stats().pds, 1);

        drop(dev);
        let stats = soft.stats();
        assert_eq!((stats.contexts, stats.pds), (0, 0));
        assert_eq!(stats.invalid_releases, 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(LinkLayer::Infiniband.to_string(), "INFINIBAND");
        assert_eq!(PortState::Active.to_string(), "ACTIVE");
    }
}

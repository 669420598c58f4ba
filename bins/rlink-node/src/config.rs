use std::path::Path;

use anyhow::{bail, Context};
use rlink_logging::LogConfig;
use rlink_types::{Address, RegionId};
use rlink_verbs::{AccessFlags, QpConfig};
use serde::{Deserialize, Serialize};

/// Configuration of one `rlink-node` process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Where the memory service listens, e.g. `TCP://0.0.0.0:8600`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Devices the software fabric exposes.
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,

    /// Device to open; the first listed device if unset.
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default = "default_port")]
    pub port: u8,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Regions registered at startup.
    #[serde(default)]
    pub regions: Vec<RegionConfig>,

    #[serde(default)]
    pub qp: QpConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: u64,
    pub size: usize,
    /// Peers may read but not write the region.
    #[serde(default)]
    pub read_only: bool,
}

impl RegionConfig {
    pub fn region_id(&self) -> RegionId {
        RegionId(self.id)
    }

    pub fn access(&self) -> AccessFlags {
        if self.read_only {
            AccessFlags::default().clear().add_local_write().add_remote_read()
        } else {
            AccessFlags::default()
        }
    }
}

fn default_listen() -> String {
    "TCP://127.0.0.1:8600".into()
}
fn default_devices() -> Vec<String> {
    vec!["soft_0".into()]
}
fn default_port() -> u8 {
    1
}
fn default_fetch_timeout_ms() -> u64 {
    5000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            devices: default_devices(),
            device: None,
            port: default_port(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            regions: vec![RegionConfig {
                id: 5,
                size: 1 << 20,
                read_only: false,
            }],
            qp: QpConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        if self.devices.is_empty() {
            bail!("at least one device is required");
        }
        if let Some(device) = &self.device {
            if !self.devices.contains(device) {
                bail!("device {device} is not one of {:?}", self.devices);
            }
        }
        let mut ids: Vec<u64> = self.regions.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            bail!("duplicate region id");
        }
        if self.regions.iter().any(|r| r.size == 0) {
            bail!("region size must be non-zero");
        }
        self.qp.validate()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<Address> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address {}", self.listen))
    }
}

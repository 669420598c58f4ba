//! Queue-pair configuration.

use rlink_types::status_code::StatusCode;
use rlink_types::{make_error_msg, Result};
use serde::{Deserialize, Serialize};

const VALID_PATH_MTUS: [u32; 5] = [256, 512, 1024, 2048, 4096];

/// Parameters used when creating and connecting a reliable connection.
///
/// The connection uses the port its device was opened on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpConfig {
    /// Service level (InfiniBand SL).
    #[serde(default)]
    pub sl: u8,

    /// Traffic class for RoCE.
    #[serde(default)]
    pub traffic_class: u8,

    #[serde(default)]
    pub pkey_index: u16,

    /// Starting packet sequence number, published in the connection identity.
    #[serde(default)]
    pub start_psn: u32,

    /// Path MTU in bytes; one of 256, 512, 1024, 2048, 4096.
    #[serde(default = "default_path_mtu")]
    pub path_mtu: u32,

    /// Minimum RNR (Receiver Not Ready) retry timer.
    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,

    /// Timeout exponent. The actual timeout is `4.096us * 2^timeout`.
    #[serde(default = "default_timeout")]
    pub timeout: u8,

    /// Number of transport-level retries.
    #[serde(default = "default_retry_cnt")]
    pub retry_cnt: u8,

    /// Number of RNR retries; 7 means infinite.
    #[serde(default = "default_retry_cnt")]
    pub rnr_retry: u8,

    #[serde(default = "default_max_wr")]
    pub max_send_wr: u32,

    #[serde(default = "default_max_wr")]
    pub max_recv_wr: u32,

    /// Maximum number of scatter/gather elements per WR.
    #[serde(default = "default_max_sge")]
    pub max_sge: u32,

    /// Maximum number of outstanding RDMA read/atomic operations.
    #[serde(default = "default_max_rd_atomic")]
    pub max_rd_atomic: u8,
}

fn default_path_mtu() -> u32 {
    1024
}
fn default_min_rnr_timer() -> u8 {
    12
}
fn default_timeout() -> u8 {
    14
}
fn default_retry_cnt() -> u8 {
    7
}
fn default_max_wr() -> u32 {
    128
}
fn default_max_sge() -> u32 {
    1
}
fn default_max_rd_atomic() -> u8 {
    16
}

impl Default for QpConfig {
    fn default() -> Self {
        Self {
            sl: 0,
            traffic_class: 0,
            pkey_index: 0,
            start_psn: 0,
            path_mtu: default_path_mtu(),
            min_rnr_timer: default_min_rnr_timer(),
            timeout: default_timeout(),
            retry_cnt: default_retry_cnt(),
            rnr_retry: default_retry_cnt(),
            max_send_wr: default_max_wr(),
            max_recv_wr: default_max_wr(),
            max_sge: default_max_sge(),
            max_rd_atomic: default_max_rd_atomic(),
        }
    }
}

impl QpConfig {
    /// Completion queue depth: one entry per send and receive slot.
    pub fn cq_entries(&self) -> u32 {
        self.max_send_wr + self.max_recv_wr
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_PATH_MTUS.contains(&self.path_mtu) {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!("path_mtu {} is not one of {:?}", self.path_mtu, VALID_PATH_MTUS),
            );
        }
        if self.max_send_wr == 0 || self.max_recv_wr == 0 || self.max_sge == 0 {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                "max_send_wr, max_recv_wr and max_sge must be non-zero",
            );
        }
        if self.timeout > 31 || self.min_rnr_timer > 31 {
            return make_error_msg(StatusCode::INVALID_CONFIG, "timer exponents are 5-bit values");
        }
        if self.retry_cnt > 7 || self.rnr_retry > 7 {
            return make_error_msg(StatusCode::INVALID_CONFIG, "retry counts are 3-bit values");
        }
        if self.start_psn >= 1 << 24 {
            return make_error_msg(StatusCode::INVALID_CONFIG, "start_psn is a 24-bit value");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QpConfig::default();
        assert_eq!(config.timeout, 14);
        assert_eq!(config.retry_cnt, 7);
        assert_eq!(config.cq_entries(), 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: QpConfig = toml::from_str("path_mtu = 4096\nmax_send_wr = 8").unwrap();
        assert_eq!(config.path_mtu, 4096);
        assert_eq!(config.max_send_wr, 8);
        assert_eq!(config.max_recv_wr, 128);
        assert_eq!(config.cq_entries(), 136);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_mtu = QpConfig {
            path_mtu: 1500,
            ..QpConfig::default()
        };
        assert_eq!(
            bad_mtu.validate().unwrap_err().code(),
            StatusCode::INVALID_CONFIG
        );

        let no_wr = QpConfig {
            max_send_wr: 0,
            ..QpConfig::default()
        };
        assert!(no_wr.validate().is_err());

        let big_psn = QpConfig {
            start_psn: 1 << 24,
            ..QpConfig::default()
        };
        assert!(big_psn.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = QpConfig {
            sl: 3,
            ..QpConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: QpConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}

//! Configuration types for serialgate-node.
//! Parsed from ~/.serialgate/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::session::SessionConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
    /// Delay before reopening the serial device after its session ends.
    #[serde(default = "default_2000")]
    pub reconnect_delay_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            listen_addr: default_listen_addr(),
            serial_device: default_serial_device(),
            reconnect_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Sync deadline once the device has confirmed liveness.
    #[serde(default = "default_5000")]
    pub timeout_interval_ms: u64,
    /// Retry interval for topic discovery while the device is silent.
    #[serde(default = "default_1000")]
    pub attempt_interval_ms: u64,
    #[serde(default = "default_rx_buffer")]
    pub rx_buffer_bytes: usize,
    #[serde(default = "default_64")]
    pub write_queue_depth: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_interval_ms: 5000,
            attempt_interval_ms: 1000,
            rx_buffer_bytes: default_rx_buffer(),
            write_queue_depth: 64,
        }
    }
}

impl SessionSection {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout_interval: Duration::from_millis(self.timeout_interval_ms),
            attempt_interval: Duration::from_millis(self.attempt_interval_ms),
            rx_buffer_bytes: self.rx_buffer_bytes,
            write_queue_depth: self.write_queue_depth.max(1),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0:11411".into()
}
fn default_serial_device() -> String {
    "/dev/ttyACM0".into()
}
fn default_64() -> usize {
    64
}
fn default_1000() -> u64 {
    1000
}
fn default_2000() -> u64 {
    2000
}
fn default_5000() -> u64 {
    5000
}
fn default_rx_buffer() -> usize {
    serialgate_protocol::codec::DEFAULT_RX_CAPACITY
}

impl GatewayConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: GatewayConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

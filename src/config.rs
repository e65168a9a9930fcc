// src/config.rs
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mtu: usize,
    pub channel_capacity: usize,
    pub tcp_window: u16,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-direction cap on buffered bytes waiting for a complete message.
    pub max_sniff_buffer: usize,
    pub late_packet_recovery: bool,
    pub interception: InterceptionConfig,
    pub exclusion: ExclusionConfig,
    pub metrics_listen: Option<SocketAddr>,
    pub tun_fd: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptionConfig {
    pub enabled: bool,
    pub ca_dir: PathBuf,
    /// Routed through the relay and decrypted.
    pub intercept_ports: Vec<u16>,
    /// Routed through the relay, bytes passed through untouched.
    pub tunnel_ports: Vec<u16>,
    pub relay_bind: SocketAddr,
    pub extra_root_pems: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionMode {
    #[default]
    None,
    Mark,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExclusionConfig {
    pub mode: ExclusionMode,
    pub mark: u32,
    pub device: String,
}

impl EngineConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let config: EngineConfig =
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu < 576 {
            anyhow::bail!("mtu {} is below the IPv4 minimum of 576", self.mtu);
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be positive");
        }
        if self.exclusion.mode == ExclusionMode::Device && self.exclusion.device.is_empty() {
            anyhow::bail!("exclusion mode \"device\" needs a device name");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl InterceptionConfig {
    pub fn intercepts(&self, port: u16) -> bool {
        self.enabled && self.intercept_ports.contains(&port)
    }

    pub fn tunnels(&self, port: u16) -> bool {
        self.enabled && self.tunnel_ports.contains(&port)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mtu: 1500,
            channel_capacity: 1024,
            tcp_window: 65535,
            idle_timeout_secs: 120,
            sweep_interval_secs: 15,
            max_sniff_buffer: 1024 * 1024,
            late_packet_recovery: true,
            interception: InterceptionConfig::default(),
            exclusion: ExclusionConfig::default(),
            metrics_listen: None,
            tun_fd: None,
        }
    }
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        InterceptionConfig {
            enabled: true,
            ca_dir: PathBuf::from("./ca"),
            intercept_ports: vec![443],
            tunnel_ports: vec![80],
            relay_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            extra_root_pems: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mtu": 9000, "interception": {{"intercept_ports": [443, 8443]}}, "exclusion": {{"mode": "mark", "mark": 51}}}}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.mtu, 9000);
        assert_eq!(config.idle_timeout_secs, 120);
        assert!(config.interception.intercepts(8443));
        assert!(config.interception.tunnels(80));
        assert_eq!(config.exclusion.mode, ExclusionMode::Mark);
        assert_eq!(config.exclusion.mark, 51);
    }

    #[test]
    fn test_disabled_interception_routes_nothing() {
        let mut config = InterceptionConfig::default();
        config.enabled = false;
        assert!(!config.intercepts(443));
        assert!(!config.tunnels(80));
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.exclusion.mode = ExclusionMode::Device;
        assert!(config.validate().is_err());

        config.exclusion.device = "wlan0".into();
        config.mtu = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(EngineConfig::load("/nonexistent/tunscope.json").is_err());
    }
}

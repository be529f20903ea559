//! Daemon Configuration
//!
//! Configuration management for the PeerLink daemon.

use anyhow::{Context, Result};
use peerlink_protocol::{FrameMode, PairedOrder, ServiceConfig, TcpPeer};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local device identity
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Known peers
    #[serde(default)]
    pub peers: Vec<TcpPeer>,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name sent with every message
    pub name: String,

    /// Address sent with every message; peers list us under it
    #[serde(default)]
    pub address: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Socket the daemon accepts sessions on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Seconds to wait for an outbound connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Wire framing; both ends must agree
    #[serde(default)]
    pub framing: FrameMode,

    /// Paired list ordering
    #[serde(default)]
    pub paired_order: PairedOrder,

    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (device registry)
    pub data_dir: PathBuf,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1739))
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("peerlink")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout(),
            framing: FrameMode::default(),
            paired_order: PairedOrder::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("peerlink");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                address: None,
            },
            network: NetworkConfig::default(),
            peers: Vec::new(),
            paths: PathConfig {
                config_dir: default_config_dir(),
                data_dir,
            },
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location
    ///
    /// A missing file at the default location is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_dir().join("daemon.toml"),
        };

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {:?}", config_path))?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else if path.is_some() {
            anyhow::bail!("Config file {:?} does not exist", config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;

        let config_path = self.paths.config_dir.join("daemon.toml");
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir)
            .context("Failed to create data directory")?;
        Ok(())
    }

    /// Path of the paired-device registry
    pub fn registry_path(&self) -> PathBuf {
        self.paths.data_dir.join("devices.json")
    }

    /// Session settings for the protocol service
    ///
    /// Ping interval and pong timeout are protocol constants, not settings.
    pub fn service_config(&self) -> ServiceConfig {
        let network = &self.network;
        ServiceConfig {
            local_name: Some(self.device.name.clone()),
            local_address: self.device.address.clone(),
            connect_timeout: Duration::from_secs(network.connect_timeout_secs),
            framing: network.framing,
            paired_order: network.paired_order,
            ..ServiceConfig::default()
        }
    }
}

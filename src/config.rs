//! Runtime configuration
//!
//! Loaded from YAML. Every section and key has a default, so an empty document is a
//! valid configuration:
//!
//! ```rust
//! use clockwire::Config;
//!
//! let config = Config::from_yaml("link:\n  ack_timeout_ms: 2500\n").unwrap();
//! assert_eq!(config.link.ack_timeout().as_millis(), 2500);
//! assert_eq!(config.link.max_outstanding, 16);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::types::wire::{cmd_type, fota_layout};
use crate::{ProtocolError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ipc: IpcConfig,
    pub link: LinkConfig,
    pub commands: CommandConfig,
    pub fota: FotaConfig,
    pub login: LoginConfig,
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub log_filter: Option<String>,
}

impl Config {
    /// Read and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ProtocolError::ConfigFile {
            path: path.to_path_buf(),
            source: Some(Box::new(e)),
        })?;
        let config = Self::from_yaml(&text).map_err(|e| match e {
            ProtocolError::Config { .. } => e,
            other => ProtocolError::ConfigFile {
                path: path.to_path_buf(),
                source: Some(Box::new(other)),
            },
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml_ng::from_str(text)
                .map_err(|e| ProtocolError::parse("configuration YAML", e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable the protocol.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 9] = [
            ("ipc.queue_depth", self.ipc.queue_depth as u64),
            ("link.max_outstanding", self.link.max_outstanding as u64),
            ("link.ack_timeout_ms", self.link.ack_timeout_ms),
            ("link.scan_interval_ms", self.link.scan_interval_ms),
            ("link.timer_join_ms", self.link.timer_join_ms),
            ("link.tcp_join_ms", self.link.tcp_join_ms),
            ("link.ipc_join_ms", self.link.ipc_join_ms),
            ("commands.timeout_secs", self.commands.timeout_secs),
            ("fota.ack_timeout_secs", self.fota.ack_timeout_secs),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ProtocolError::config(format!("{key} must be greater than zero")));
            }
        }
        if self.commands.extended_timeout_secs < self.commands.timeout_secs {
            return Err(ProtocolError::config(
                "commands.extended_timeout_secs must not be shorter than commands.timeout_secs",
            ));
        }
        // A connection overflowing its inbound channel is torn down, so one block
        // (META plus its segments) must fit.
        if self.link.channel_depth <= fota_layout::SEGMENTS_PER_BLOCK {
            return Err(ProtocolError::config(format!(
                "link.channel_depth must exceed {}",
                fota_layout::SEGMENTS_PER_BLOCK
            )));
        }
        Ok(())
    }
}

/// Connection process listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: "0.0.0.0:3334".to_string() }
    }
}

/// Inter-process queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket shared by the connection process and core
    pub packet_socket: PathBuf,
    /// Socket shared by the site process and core
    pub site_socket: PathBuf,
    pub queue_depth: usize,
    pub connect_attempts: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            packet_socket: PathBuf::from("/tmp/clockwire/packet.sock"),
            site_socket: PathBuf::from("/tmp/clockwire/site.sock"),
            queue_depth: crate::ipc::QUEUE_DEPTH,
            connect_attempts: 20,
        }
    }
}

/// Per-connection link parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub max_outstanding: usize,
    pub ack_timeout_ms: u64,
    pub scan_interval_ms: u64,
    pub timer_join_ms: u64,
    pub tcp_join_ms: u64,
    pub ipc_join_ms: u64,
    /// Depth of the channels between a connection's tasks
    pub channel_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_outstanding: crate::connection::MAX_OUTSTANDING_TRANSACTIONS,
            ack_timeout_ms: 5000,
            scan_interval_ms: 250,
            timer_join_ms: 1000,
            tcp_join_ms: 2000,
            ipc_join_ms: 2000,
            channel_depth: 16,
        }
    }
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn timer_join(&self) -> Duration {
        Duration::from_millis(self.timer_join_ms)
    }

    pub fn tcp_join(&self) -> Duration {
        Duration::from_millis(self.tcp_join_ms)
    }

    pub fn ipc_join(&self) -> Duration {
        Duration::from_millis(self.ipc_join_ms)
    }
}

/// Command response timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub timeout_secs: u64,
    pub extended_timeout_secs: u64,
    /// Command types that get the extended timeout
    pub slow_commands: Vec<u8>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            extended_timeout_secs: 200,
            slow_commands: vec![cmd_type::SYNC, cmd_type::ACK_STRESS_TEST],
        }
    }
}

impl CommandConfig {
    pub fn timeout_for(&self, command_type: u8) -> Duration {
        if self.slow_commands.contains(&command_type) {
            Duration::from_secs(self.extended_timeout_secs)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FotaConfig {
    pub firmware_dir: PathBuf,
    /// Wait for each FOTA acknowledgment
    pub ack_timeout_secs: u64,
    /// Push the newest stored firmware to terminals that announce an older version
    pub auto_update: bool,
}

impl Default for FotaConfig {
    fn default() -> Self {
        Self { firmware_dir: PathBuf::from("fw_versions"), ack_timeout_secs: 200, auto_update: false }
    }
}

impl FotaConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub cooldown_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self { cooldown_secs: 120 }
    }
}

impl LoginConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

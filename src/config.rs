//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VpnctlError, VpnctlResult};
use crate::vpn::state::{AuthCredential, NodeId};

/// Main vpnctl configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpnctlConfig {
    /// Daemon process settings
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Management interface settings
    #[serde(default)]
    pub management: ManagementSettings,
    /// Per-node configuration source
    #[serde(default)]
    pub nodes: NodeSettings,
    /// Locally configured credential
    #[serde(default)]
    pub credentials: CredentialSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Daemon executable, looked up in PATH unless absolute
    #[serde(default = "default_program")]
    pub program: String,
    /// Port the daemon's management interface listens on
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    /// Delay between spawning the daemon and attaching (milliseconds)
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Time allowed after SIGTERM before SIGKILL (seconds)
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
    /// Directory for temporary daemon config files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementSettings {
    /// Bound on opening the management socket (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a closed management socket may precede the daemon's exit (milliseconds)
    #[serde(default = "default_exit_settle_ms")]
    pub exit_settle_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Directory holding `<node_id>.ovpn` files
    #[serde(default = "default_nodes_dir")]
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// Credential answered to password challenges
    #[serde(default)]
    pub auth: AuthCredential,
    /// When set, only these nodes may be connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_nodes: Option<Vec<NodeId>>,
}

fn default_program() -> String {
    "openvpn".to_string()
}

fn default_management_port() -> u16 {
    1203
}

fn default_startup_grace_ms() -> u64 {
    1000
}

fn default_kill_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_exit_settle_ms() -> u64 {
    500
}

fn default_nodes_dir() -> PathBuf {
    PathBuf::from("/etc/vpnctl/nodes")
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            management_port: default_management_port(),
            startup_grace_ms: default_startup_grace_ms(),
            kill_timeout_secs: default_kill_timeout_secs(),
            temp_dir: None,
        }
    }
}

impl Default for ManagementSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            exit_settle_ms: default_exit_settle_ms(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            config_dir: default_nodes_dir(),
        }
    }
}

/// Runtime parameters of a [`ConnectionController`](crate::vpn::ConnectionController)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub program: String,
    pub management_port: u16,
    pub startup_grace: Duration,
    pub kill_timeout: Duration,
    pub connect_timeout: Duration,
    pub exit_settle: Duration,
    pub temp_dir: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        VpnctlConfig::default().controller_settings()
    }
}

impl VpnctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnctlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnctlResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnctlError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            program: self.daemon.program.clone(),
            management_port: self.daemon.management_port,
            startup_grace: Duration::from_millis(self.daemon.startup_grace_ms),
            kill_timeout: Duration::from_secs(self.daemon.kill_timeout_secs),
            connect_timeout: Duration::from_millis(self.management.connect_timeout_ms),
            exit_settle: Duration::from_millis(self.management.exit_settle_ms),
            temp_dir: self.daemon.temp_dir.clone(),
        }
    }
}

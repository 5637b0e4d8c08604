use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the nasvm daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hypervisor: HypervisorConfig,
    pub console: ConsoleConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.hypervisor.stop_timeout_secs >= 1,
            "hypervisor.stop_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.hypervisor.kill_timeout_secs >= 1,
            "hypervisor.kill_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            !self.hypervisor.nmdm_prefix.is_empty(),
            "hypervisor.nmdm_prefix must not be empty"
        );
        anyhow::ensure!(
            !self.network.bridge_prefix.is_empty()
                && self.network.bridge_prefix.chars().all(|c| c.is_ascii_alphabetic()),
            "network.bridge_prefix must be a non-empty alphabetic interface prefix"
        );
        Ok(())
    }
}

/// bhyve / bhyvectl configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub bhyve_binary: PathBuf,
    pub bhyvectl_binary: PathBuf,
    /// Directory holding the UEFI firmware images.
    pub firmware_dir: PathBuf,
    /// Serial console device prefix; VM `n` gets `{prefix}{n}A`.
    pub nmdm_prefix: String,
    /// Grace period after a force-poweroff before the process is sent SIGTERM.
    pub stop_timeout_secs: u64,
    /// Grace period after SIGTERM before SIGKILL.
    pub kill_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            bhyve_binary: PathBuf::from("/usr/sbin/bhyve"),
            bhyvectl_binary: PathBuf::from("/usr/sbin/bhyvectl"),
            firmware_dir: PathBuf::from("/usr/local/share/uefi-firmware"),
            nmdm_prefix: "/dev/nmdm".into(),
            stop_timeout_secs: 10,
            kill_timeout_secs: 5,
        }
    }
}

impl HypervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

/// Web console proxy (noVNC + websockify).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub websockify_binary: PathBuf,
    pub novnc_dir: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            websockify_binary: PathBuf::from("/usr/local/libexec/novnc/utils/websockify/run"),
            novnc_dir: PathBuf::from("/usr/local/libexec/novnc/"),
        }
    }
}

/// Host network tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ifconfig_binary: PathBuf,
    pub route_binary: PathBuf,
    /// Interfaces with this prefix are considered bridges.
    pub bridge_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ifconfig_binary: PathBuf::from("/sbin/ifconfig"),
            route_binary: PathBuf::from("/sbin/route"),
            bridge_prefix: "bridge".into(),
        }
    }
}

/// VM datastore and disk cloning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding the VM and device tables.
    pub datastore_path: PathBuf,
    /// Prefix of zvol device paths; what follows is the dataset name.
    pub zvol_prefix: String,
    pub zfs_binary: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            datastore_path: PathBuf::from("/var/db/nasvm/vms.json"),
            zvol_prefix: "/dev/zvol/".into(),
            zfs_binary: PathBuf::from("/sbin/zfs"),
        }
    }
}

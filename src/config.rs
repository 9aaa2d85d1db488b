//! Launcher configuration.
//!
//! Read from `launcher.toml` in the config directory (see
//! [`LauncherPaths`](crate::paths::LauncherPaths)). Every field has a default,
//! so a missing file or a partial file is fine:
//!
//! ```toml
//! memory = "2G"
//! monitor_port = 10044
//!
//! [network]
//! host_forwards = [{ host = 2222, guest = 22 }]
//!
//! [accelerator]
//! interpreter = "tcg,thread=single"
//!
//! [inputs]
//! max_bytes = 1023
//! over_length = "truncate"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

/// Top-level launcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    /// `argv[0]` handed to the monitor.
    pub program_name: String,
    /// Guest memory size, in the monitor's `-m` syntax.
    pub memory: String,
    pub network: NetworkConfig,
    /// TCP port for the human monitor; `None` leaves the monitor disabled.
    pub monitor_port: Option<u16>,
    /// Kernel command line appended when booting from a disk image.
    pub disk_boot_append: String,
    /// 9p mount tag for the shared folder.
    pub shared_folder_tag: String,
    pub accelerator: AcceleratorConfig,
    pub inputs: InputLimits,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program_name: "qemu-system".to_string(),
            memory: "4G".to_string(),
            network: NetworkConfig::default(),
            monitor_port: Some(10044),
            disk_boot_append: "tcti_disk=file".to_string(),
            shared_folder_tag: "host".to_string(),
            accelerator: AcceleratorConfig::default(),
            inputs: InputLimits::default(),
        }
    }
}

impl LauncherConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no launcher config; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read launcher config {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Failed to parse launcher config {}", path.display()))
    }

    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.inputs.max_bytes == 0 {
            anyhow::bail!("inputs.max_bytes must be at least 1");
        }
        Ok(config)
    }
}

/// User-mode networking for the guest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub subnet: String,
    pub dhcp_start: String,
    pub host_forwards: Vec<PortForward>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: "192.168.100.0/24".to_string(),
            dhcp_start: "192.168.100.100".to_string(),
            host_forwards: vec![
                PortForward { host: 10022, guest: 22 },
                PortForward { host: 10023, guest: 23 },
            ],
        }
    }
}

/// A TCP port forwarded from the host into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

/// `-accel` values for each execution strategy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcceleratorConfig {
    /// Used when JIT was requested and enablement did not fail.
    pub jit: String,
    /// Used otherwise; must not need writable+executable memory.
    pub interpreter: String,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            jit: "tcg,thread=multi,split-wx=on".to_string(),
            interpreter: "tcg,thread=single".to_string(),
        }
    }
}

/// Bounds applied to caller-supplied paths and names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputLimits {
    /// Longest accepted input in bytes, excluding the C terminator.
    pub max_bytes: usize,
    pub over_length: OverLengthPolicy,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_bytes: 1023,
            over_length: OverLengthPolicy::Reject,
        }
    }
}

/// What to do with an input longer than [`InputLimits::max_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverLengthPolicy {
    /// Refuse the launch with [`LaunchError::InputTooLong`](crate::error::LaunchError::InputTooLong).
    #[default]
    Reject,
    /// Cut the input to the bound and continue, logging a warning.
    Truncate,
}

//! # Configuration
//!
//! An optional TOML file; every key has a default matching the stock
//! Raspberry Pi OS layout, so a missing file is not an error.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use firstboot_mount::MountSpec;

use crate::kernel_cmdline::{Cmdline, INIT};

/// Where the configuration is read from by default.
pub(crate) const CONFIG_PATH: &str = "/etc/firstboot/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub(crate) struct Config {
    /// Our own path as it appears in `init=`. When unset, it is taken from
    /// `/proc/cmdline` and then from the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) init_path: Option<Utf8PathBuf>,
    /// Enable the magic sysrq key before doing anything risky.
    pub(crate) sysrq: bool,
    /// Pause after provisioning, before tearing down.
    pub(crate) settle_seconds: u64,
    /// How long to wait for the reboot request to take effect.
    pub(crate) reboot_grace_seconds: u64,
    /// Append a record of each run here, on the root filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) journal: Option<Utf8PathBuf>,
    /// The boot partition.
    pub(crate) boot: BootConfig,
    /// The partition expansion helper.
    pub(crate) expand: ExpandConfig,
}

/// The boot (firmware) partition holding `cmdline.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub(crate) struct BootConfig {
    pub(crate) device: String,
    pub(crate) mountpoint: Utf8PathBuf,
    pub(crate) fstype: String,
    /// File name relative to the mountpoint.
    pub(crate) cmdline: Utf8PathBuf,
}

/// The external program which grows the root partition and filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub(crate) struct ExpandConfig {
    pub(crate) helper: Utf8PathBuf,
    pub(crate) args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_path: None,
            sysrq: true,
            settle_seconds: 5,
            reboot_grace_seconds: 5,
            journal: Some("/var/log/firstboot.jsonl".into()),
            boot: BootConfig::default(),
            expand: ExpandConfig::default(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            device: "/dev/mmcblk0p1".into(),
            mountpoint: "/boot".into(),
            fstype: "vfat".into(),
            cmdline: "cmdline.txt".into(),
        }
    }
}

impl Default for ExpandConfig {
    fn default() -> Self {
        Self {
            helper: "/first_boot/expand_partitions.py".into(),
            args: Vec::new(),
        }
    }
}

impl BootConfig {
    pub(crate) fn mount_spec(&self) -> MountSpec {
        MountSpec::storage(&self.device, &self.mountpoint, &self.fstype)
    }

    pub(crate) fn cmdline_path(&self) -> Utf8PathBuf {
        self.mountpoint.join(&self.cmdline)
    }
}

impl Config {
    /// Parse a configuration file; a missing file yields the defaults.
    #[context("Loading {path}")]
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {path}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&buf)
    }

    fn parse(buf: &str) -> Result<Self> {
        toml::from_str(buf).context("Parsing configuration")
    }

    /// Render the effective configuration.
    pub(crate) fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("Serializing configuration")
    }

    pub(crate) fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }

    pub(crate) fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_seconds)
    }

    /// The path of this program as it appears in the `init=` trigger.
    #[context("Resolving init path")]
    pub(crate) fn resolve_init_path(&self) -> Result<Utf8PathBuf> {
        if let Some(p) = self.init_path.as_ref() {
            return Ok(p.clone());
        }
        match Cmdline::from_proc() {
            Ok(cmdline) => {
                if let Some(v) = cmdline.value_of_utf8(INIT)? {
                    tracing::debug!("Found {INIT}={v} in /proc/cmdline");
                    return Ok(v.into());
                }
            }
            Err(e) => tracing::debug!("Reading /proc/cmdline: {e:#}"),
        }
        let exe = std::env::current_exe().context("Querying current executable")?;
        Utf8PathBuf::try_from(exe).map_err(Into::into)
    }
}

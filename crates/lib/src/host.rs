//! The operating system as seen by the first-boot sequence.

use std::process::{Command, ExitStatus};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;

use firstboot_mount::{Access, MountSpec, Mounted, Mounter, SystemMounter};
use firstboot_utils::CommandRunExt;

use crate::config::ExpandConfig;

/// Writing `1` here enables all magic sysrq functions.
pub(crate) const SYSRQ_ENABLE: &str = "/proc/sys/kernel/sysrq";
/// Writing `b` here reboots immediately, without syncing or unmounting.
const SYSRQ_TRIGGER: &str = "/proc/sysrq-trigger";
/// The kernel does not give init a `PATH`.
const DEFAULT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything the first-boot sequence does to the system goes through here.
pub(crate) trait Host: Mounter {
    /// Write a value to a kernel control file such as a sysctl.
    fn write_control(&self, path: &Utf8Path, value: &str) -> Result<()>;
    /// Run the partition expansion helper to completion.
    fn run_helper(&self, helper: &ExpandConfig) -> Result<ExitStatus>;
    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
    /// Ask the kernel to restart now. Returns if the request was accepted
    /// but has not taken effect yet.
    fn reboot(&self) -> Result<()>;
}

/// The running system.
#[derive(Debug, Default)]
pub(crate) struct SystemHost {
    mounter: SystemMounter,
}

impl Mounter for SystemHost {
    fn mount(&self, spec: &MountSpec) -> Result<Mounted> {
        self.mounter.mount(spec)
    }

    fn remount(&self, target: &Utf8Path, access: Access) -> Result<()> {
        self.mounter.remount(target, access)
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        self.mounter.unmount(target)
    }

    fn sync(&self) {
        self.mounter.sync()
    }
}

impl Host for SystemHost {
    fn write_control(&self, path: &Utf8Path, value: &str) -> Result<()> {
        std::fs::write(path, value).with_context(|| format!("Writing {value} to {path}"))
    }

    fn run_helper(&self, helper: &ExpandConfig) -> Result<ExitStatus> {
        let mut cmd = Command::new(&helper.helper);
        cmd.args(&helper.args);
        if std::env::var_os("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        cmd.log_debug().run_status()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }

    fn reboot(&self) -> Result<()> {
        match std::fs::write(SYSRQ_TRIGGER, "b") {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Writing {SYSRQ_TRIGGER}: {e}; falling back to reboot(2)");
                rustix::system::reboot(rustix::system::RebootCommand::Restart)
                    .context("reboot(2)")
            }
        }
    }
}

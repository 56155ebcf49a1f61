//! Handling of system restarts/reboot

use std::io::Write;
use std::time::Duration;

use fn_error_context::context;

use crate::host::Host;

/// Flush everything and ask the kernel for an immediate restart.
///
/// Nothing else is running this early, so there is no service manager to
/// go through. If the request has not taken effect after `grace`, this
/// returns and the caller is expected to exit.
#[context("Initiating reboot")]
pub(crate) fn reboot<H: Host + ?Sized>(host: &H, grace: Duration) -> anyhow::Result<()> {
    // Flush output streams
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    host.sync();
    let r = host.reboot();
    // The sysrq path reboots synchronously, so getting here at all means
    // the kernel is taking its time, or refused. Either way pid 1 must not
    // exit straight away.
    tracing::debug!("Requested reboot (accepted: {}), sleeping", r.is_ok());
    host.sleep(grace);
    tracing::warn!("Still running {}s after reboot request", grace.as_secs());
    r
}

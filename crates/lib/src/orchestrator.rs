//! The first-boot sequence.
//!
//! This runs as pid 1 with only a read-only root mounted. Every step is
//! attempted in order regardless of how the previous one went, and every
//! path ends in a reboot: on a headless device the only recovery is to try
//! again on the next boot. The one decision point is whether the expansion
//! helper succeeded; only then is the `init=` trigger removed, which is
//! what stops this from running again.

use std::fmt::{self, Display};

use anyhow::{anyhow, ensure, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Serialize;

use firstboot_mount::{MountSet, MountSpec, Mounter};

use crate::bootcfg::{self, Edit};
use crate::config::Config;
use crate::expand::{self, Expansion};
use crate::host::{Host, SYSRQ_ENABLE};
use crate::journal;
use crate::reboot;

/// The individually reported parts of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Step {
    MountBase,
    EnableSysrq,
    RemountRootRw,
    Expand,
    PatchBootConfig,
    Journal,
    Teardown,
    Reboot,
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::MountBase => "mount-base",
            Step::EnableSysrq => "enable-sysrq",
            Step::RemountRootRw => "remount-root-rw",
            Step::Expand => "expand",
            Step::PatchBootConfig => "patch-boot-config",
            Step::Journal => "journal",
            Step::Teardown => "teardown",
            Step::Reboot => "reboot",
        })
    }
}

/// Where the sequence has got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Start,
    MountedBase,
    RootRw,
    ExpandAttempted,
    ConfigPatched,
    Settle,
    Reboot,
}

/// Whether this boot finished the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Provisioning {
    /// The trigger is gone; the next boot is a normal one.
    Provisioned,
    /// The trigger is (probably) still there; the next boot tries again.
    Deferred,
}

/// The outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct StepRecord {
    pub(crate) step: Step,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

/// Everything that happened during a run.
#[derive(Debug)]
pub(crate) struct Report {
    pub(crate) steps: Vec<StepRecord>,
    pub(crate) states: Vec<State>,
    pub(crate) expansion: Option<Expansion>,
}

impl Report {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            states: vec![State::Start],
            expansion: None,
        }
    }

    fn enter(&mut self, state: State) {
        tracing::debug!(?state, "entering");
        self.states.push(state);
    }

    /// Log and keep the outcome of a step; never propagates the error.
    fn record<T>(&mut self, step: Step, r: Result<T>) -> Option<T> {
        match r {
            Ok(v) => {
                tracing::info!(%step, "completed");
                self.steps.push(StepRecord { step, error: None });
                Some(v)
            }
            Err(e) => {
                let error = format!("{e:#}");
                tracing::error!(%step, "{error}");
                self.steps.push(StepRecord {
                    step,
                    error: Some(error),
                });
                None
            }
        }
    }

    pub(crate) fn provisioning(&self) -> Provisioning {
        if self.states.contains(&State::ConfigPatched) {
            Provisioning::Provisioned
        } else {
            Provisioning::Deferred
        }
    }

    pub(crate) fn failed(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.error.is_some())
    }
}

/// Kernel filesystems needed by everything else.
fn baseline_mounts() -> [MountSpec; 3] {
    [
        MountSpec::pseudo("proc", "/proc"),
        MountSpec::pseudo("sysfs", "/sys"),
        MountSpec::pseudo("tmpfs", "/run"),
    ]
}

/// Attempt every baseline mount even if an earlier one fails.
fn mount_base<M: Mounter + ?Sized>(mounts: &mut MountSet<'_, M>) -> Result<()> {
    let mut failed = Vec::new();
    for spec in baseline_mounts() {
        if let Err(e) = mounts.mount(&spec) {
            tracing::warn!("{e:#}");
            failed.push(spec.target.into_string());
        }
    }
    ensure!(failed.is_empty(), "Failed to mount {}", failed.join(", "));
    Ok(())
}

/// Remove our trigger from the boot partition's kernel command line,
/// verify it is gone, and flush it to disk.
#[context("Patching boot configuration")]
fn patch_boot_config<M: Mounter + ?Sized>(
    mounts: &mut MountSet<'_, M>,
    config: &Config,
) -> Result<Edit> {
    let init_path = config.resolve_init_path()?;
    let token = bootcfg::trigger_token(&init_path);
    let boot = &config.boot;
    mounts.mount(&boot.mount_spec())?;
    let path = boot.cmdline_path();
    let edit = bootcfg::strip_trigger(&path, &init_path)?;
    match edit {
        Edit::Changed => tracing::info!("Removed {token} from {path}"),
        Edit::Unchanged => tracing::info!("No {token} in {path}; already provisioned"),
    }
    ensure!(
        !bootcfg::contains_trigger(&path, &init_path)?,
        "{path} still contains {token} after editing"
    );
    mounts.remount_ro(&boot.mountpoint)?;
    mounts.sync();
    Ok(edit)
}

fn expansion_result(expansion: Expansion) -> Result<()> {
    match expansion {
        Expansion::Expanded => Ok(()),
        Expansion::NotExpanded { code: Some(code) } => {
            Err(anyhow!("Root partition not expanded (helper exited with {code})"))
        }
        Expansion::NotExpanded { code: None } => {
            Err(anyhow!("Root partition not expanded (helper did not exit normally)"))
        }
    }
}

/// Run the whole first-boot sequence, ending with a reboot request.
///
/// This only returns if the reboot did not take effect within the grace
/// period.
pub(crate) fn run<H: Host + ?Sized>(host: &H, config: &Config) -> Report {
    let mut report = Report::new();
    let root = Utf8Path::new("/");
    {
        let mut mounts = MountSet::new(host);

        report.record(Step::MountBase, mount_base(&mut mounts));
        report.enter(State::MountedBase);

        if config.sysrq {
            let r = host.write_control(Utf8Path::new(SYSRQ_ENABLE), "1");
            report.record(Step::EnableSysrq, r);
        }

        report.record(Step::RemountRootRw, mounts.remount_rw(root));
        report.enter(State::RootRw);

        let expansion = expand::expand_root(host, &config.expand);
        report.expansion = Some(expansion);
        report.record(Step::Expand, expansion_result(expansion));
        report.enter(State::ExpandAttempted);

        if expansion.succeeded() {
            let r = patch_boot_config(&mut mounts, config);
            if report.record(Step::PatchBootConfig, r).is_some() {
                report.enter(State::ConfigPatched);
            }
        }

        report.enter(State::Settle);
        host.sleep(config.settle());

        // Root is still writable here; afterwards it is not.
        if let Some(path) = config.journal.as_deref() {
            report.record(Step::Journal, journal::append(path, &report));
        }

        report.record(Step::Teardown, mounts.teardown());
    }

    report.enter(State::Reboot);
    report.record(Step::Reboot, reboot::reboot(host, config.reboot_grace()));
    report
}

//! # Command line interface
//!
//! When the kernel starts us as pid 1 (via `init=` on its command line)
//! there is nobody to type arguments; whatever the kernel hands over is
//! ignored and the first-boot sequence runs. Otherwise a small set of
//! maintenance commands is available.

use std::ffi::OsString;

use anyhow::{ensure, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};

use crate::bootcfg::{self, Edit};
use crate::config::{Config, CONFIG_PATH};
use crate::host::SystemHost;
use crate::orchestrator;

/// Options for the `run` command.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct RunOpts {
    /// Run even though this process is not pid 1.
    ///
    /// This remounts `/`, runs the expansion helper and reboots the machine.
    #[clap(long)]
    pub(crate) allow_non_init: bool,
}

/// Options for editing the trigger in a kernel command line file.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct TriggerOpts {
    /// Path to the kernel command line file, e.g. `/boot/cmdline.txt`
    pub(crate) file: Utf8PathBuf,

    /// The program named by the trigger; defaults to the configured
    /// or detected path of this program.
    #[clap(long)]
    pub(crate) init_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
pub(crate) enum Cmd {
    /// Run the first-boot sequence; implied when running as pid 1.
    Run(RunOpts),
    /// Remove the `init=` trigger from a kernel command line file.
    StripTrigger(TriggerOpts),
    /// Append the `init=` trigger to a kernel command line file, arming
    /// provisioning for the next boot.
    AddTrigger(TriggerOpts),
    /// Print the effective configuration as TOML.
    PrintConfig,
}

/// Raspberry Pi first boot provisioning.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "firstboot", version)]
pub(crate) struct Opt {
    /// Configuration file
    #[clap(long, global = true, default_value = CONFIG_PATH)]
    pub(crate) config: Utf8PathBuf,

    #[clap(subcommand)]
    pub(crate) cmd: Cmd,
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and
/// aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    if rustix::process::getpid().is_init() {
        tracing::debug!("Running as pid 1; ignoring arguments");
        let config = Config::load(Utf8Path::new(CONFIG_PATH)).unwrap_or_else(|e| {
            tracing::error!("{e:#}; using defaults");
            Config::default()
        });
        run_sequence(&config);
        return Ok(());
    }
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    match opt.cmd {
        Cmd::Run(opts) => {
            ensure!(
                opts.allow_non_init,
                "Not running as pid 1; use --allow-non-init to run anyway"
            );
            let config = Config::load(&opt.config)?;
            run_sequence(&config);
            Ok(())
        }
        Cmd::StripTrigger(opts) => edit_trigger(&opt.config, &opts, bootcfg::strip_trigger),
        Cmd::AddTrigger(opts) => edit_trigger(&opt.config, &opts, bootcfg::add_trigger),
        Cmd::PrintConfig => {
            print!("{}", Config::load(&opt.config)?.to_toml()?);
            Ok(())
        }
    }
}

fn run_sequence(config: &Config) {
    tracing::info!(
        "Starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    let host = SystemHost::default();
    let report = orchestrator::run(&host, config);
    let failed = report.failed().count();
    tracing::error!(
        "Reboot did not take effect; exiting (provisioning {:?}, {failed} failed steps)",
        report.provisioning()
    );
}

fn edit_trigger(
    config: &Utf8Path,
    opts: &TriggerOpts,
    f: fn(&Utf8Path, &Utf8Path) -> Result<Edit>,
) -> Result<()> {
    let init_path = match opts.init_path.clone() {
        Some(p) => p,
        None => Config::load(config)?.resolve_init_path()?,
    };
    if f(&opts.file, &init_path)? == Edit::Unchanged {
        tracing::info!("{} unchanged", opts.file);
    }
    println!("{}", bootcfg::read_lossy(&opts.file)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let opt = Opt::try_parse_from(["firstboot", "run", "--allow-non-init"]).unwrap();
        assert_eq!(opt.config, CONFIG_PATH);
        assert_eq!(
            opt.cmd,
            Cmd::Run(RunOpts {
                allow_non_init: true
            })
        );
        // A subcommand is required outside of pid 1
        assert!(Opt::try_parse_from(["firstboot"]).is_err());
    }

    #[test]
    fn test_parse_trigger() {
        let opt = Opt::try_parse_from([
            "firstboot",
            "strip-trigger",
            "/boot/cmdline.txt",
            "--init-path",
            "/first_boot/orchestrator",
            "--config",
            "/tmp/firstboot.toml",
        ])
        .unwrap();
        assert_eq!(opt.config, "/tmp/firstboot.toml");
        assert_eq!(
            opt.cmd,
            Cmd::StripTrigger(TriggerOpts {
                file: "/boot/cmdline.txt".into(),
                init_path: Some("/first_boot/orchestrator".into()),
            })
        );
        let opt = Opt::try_parse_from(["firstboot", "add-trigger", "cmdline.txt"]).unwrap();
        assert!(matches!(opt.cmd, Cmd::AddTrigger(TriggerOpts { init_path: None, .. })));
    }

    #[test]
    fn test_run_requires_opt_in() {
        let opt = Opt::try_parse_from(["firstboot", "run"]).unwrap();
        let err = run_from_opt(opt).unwrap_err();
        assert!(err.to_string().contains("--allow-non-init"));
    }

    #[test]
    fn test_trigger_commands() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let file = dir.join("cmdline.txt");
        std::fs::write(&file, "console=serial0,115200 rootwait\n").unwrap();
        let args = |cmd: &str| {
            Opt::try_parse_from([
                "firstboot",
                cmd,
                file.as_str(),
                "--init-path",
                "/first_boot/orchestrator",
                "--config",
                dir.join("absent.toml").as_str(),
            ])
            .unwrap()
        };

        run_from_opt(args("add-trigger")).unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "console=serial0,115200 rootwait init=/first_boot/orchestrator\n"
        );
        run_from_opt(args("strip-trigger")).unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "console=serial0,115200 rootwait\n"
        );
    }

    #[test]
    fn test_print_config_default() {
        let td = tempfile::tempdir().unwrap();
        let config = Utf8Path::from_path(td.path()).unwrap().join("config.toml");
        let opt = Opt::try_parse_from(["firstboot", "print-config", "--config", config.as_str()])
            .unwrap();
        run_from_opt(opt).unwrap();
    }
}

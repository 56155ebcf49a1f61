//! Helpers intended for [`std::process::Command`].

use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Render the program and its arguments as a shell-quoted string.
    fn to_string_pretty(&self) -> String;

    /// Spawn the child with inherited stdio and wait for it. Unlike
    /// [`Command::status`] the error carries the command line; a non-zero
    /// exit is returned as a status, not an error.
    fn run_status(&mut self) -> Result<ExitStatus>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn to_string_pretty(&self) -> String {
        let program = self.get_program().to_string_lossy();
        let args = self.get_args().map(|a| a.to_string_lossy());
        let words: Vec<_> = std::iter::once(program).chain(args).collect();
        shlex::try_join(words.iter().map(|s| &**s)).unwrap_or_else(|_| format!("{self:?}"))
    }

    fn run_status(&mut self) -> Result<ExitStatus> {
        let status = self
            .status()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        tracing::trace!("exited: {status}");
        Ok(status)
    }
}

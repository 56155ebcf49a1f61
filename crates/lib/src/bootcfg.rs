//! Editing the `init=` trigger in the boot partition's `cmdline.txt`.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::kernel_cmdline::{Cmdline, Parameter, INIT};

/// Whether an edit changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edit {
    Changed,
    Unchanged,
}

/// The kernel argument which makes the kernel run `init_path` as pid 1.
pub(crate) fn trigger_token(init_path: &Utf8Path) -> String {
    format!("{INIT}={init_path}")
}

/// Whether the file at `path` contains the trigger for `init_path`.
#[context("Reading {path}")]
pub(crate) fn contains_trigger(path: &Utf8Path, init_path: &Utf8Path) -> Result<bool> {
    let buf = std::fs::read(path)?;
    let token = trigger_token(init_path);
    let param = Parameter::from(&token);
    let found = Cmdline::from(&buf).iter().any(|p| p == param);
    Ok(found)
}

/// Remove the trigger for `init_path`, leaving every other parameter alone.
#[context("Removing trigger from {path}")]
pub(crate) fn strip_trigger(path: &Utf8Path, init_path: &Utf8Path) -> Result<Edit> {
    let token = trigger_token(init_path);
    edit(path, |c| c.without(&Parameter::from(&token)).into_owned())
}

/// Append the trigger for `init_path`, unless it is already there.
#[context("Adding trigger to {path}")]
pub(crate) fn add_trigger(path: &Utf8Path, init_path: &Utf8Path) -> Result<Edit> {
    let token = trigger_token(init_path);
    edit(path, |c| c.with(&Parameter::from(&token)).into_owned())
}

fn edit(path: &Utf8Path, f: impl FnOnce(&Cmdline<'_>) -> Vec<u8>) -> Result<Edit> {
    let orig = std::fs::read(path)?;
    let new = f(&Cmdline::from(&orig));
    if new == orig {
        tracing::debug!("{path} unchanged");
        return Ok(Edit::Unchanged);
    }
    replace_contents(path, &new)?;
    tracing::debug!("Rewrote {path}");
    Ok(Edit::Changed)
}

/// Replace the file at `path`: write a sibling temporary file with the same
/// permissions, fsync it, and rename it over the original.
#[context("Replacing {path}")]
fn replace_contents(path: &Utf8Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let perms = std::fs::metadata(path)?.permissions();
    let mut tmp = tempfile::Builder::new()
        .prefix(".firstboot")
        .tempfile_in(dir)
        .with_context(|| format!("Creating temporary file in {dir}"))?;
    tmp.write_all(contents)?;
    tmp.as_file().set_permissions(perms)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// A convenience for display; the contents are expected to be a single line.
pub(crate) fn read_lossy(path: &Utf8Path) -> Result<String> {
    let buf = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
    Ok(String::from_utf8_lossy(&buf).trim_end().to_owned())
}

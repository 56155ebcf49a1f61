//! A persistent record of each first-boot attempt.
//!
//! The console of a headless device is usually not being watched, so each
//! run appends one JSON object per line to a file on the root filesystem.

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::Result;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::Serialize;

use crate::expand::Expansion;
use crate::orchestrator::{Provisioning, Report, StepRecord};

#[derive(Debug, Serialize)]
struct Entry<'a> {
    timestamp: DateTime<Utc>,
    version: &'static str,
    provisioning: Provisioning,
    #[serde(skip_serializing_if = "Option::is_none")]
    expansion: Option<Expansion>,
    steps: &'a [StepRecord],
}

/// Append the report so far and flush it to disk.
#[context("Appending to {path}")]
pub(crate) fn append(path: &Utf8Path, report: &Report) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let entry = Entry {
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        provisioning: report.provisioning(),
        expansion: report.expansion,
        steps: &report.steps,
    };
    let mut line = serde_json::to_vec(&entry)?;
    line.push(b'\n');
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(&line)?;
    f.sync_all()?;
    Ok(())
}

//! Growing the root partition via the external helper.

use serde::Serialize;

use crate::config::ExpandConfig;
use crate::host::Host;

/// What the helper reported. Anything but a clean zero exit is treated as
/// "not expanded", including when the root was expanded on an earlier boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Expansion {
    Expanded,
    NotExpanded {
        /// Exit code; absent if the helper could not be run or was killed.
        code: Option<i32>,
    },
}

impl Expansion {
    pub(crate) fn succeeded(self) -> bool {
        matches!(self, Expansion::Expanded)
    }
}

/// Run the helper and wait for it, with no timeout.
pub(crate) fn expand_root<H: Host + ?Sized>(host: &H, helper: &ExpandConfig) -> Expansion {
    match host.run_helper(helper) {
        Ok(st) if st.success() => {
            tracing::info!("Root partition expanded");
            Expansion::Expanded
        }
        Ok(st) => {
            tracing::debug!("{}: {st}", helper.helper);
            Expansion::NotExpanded { code: st.code() }
        }
        Err(e) => {
            tracing::error!("{e:#}");
            Expansion::NotExpanded { code: None }
        }
    }
}

//! Block Device Enumeration
//!
//! Snapshots the OS-visible block devices through `lsblk`. Creation flows
//! take a snapshot before and after issuing the controller command and
//! identify the new virtual drive's block device by set difference.

use crate::domain::ports::{CommandRunner, CommandOutput};
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Program used for device enumeration.
const LSBLK: &str = "lsblk";

/// List bare device names, one per line, excluding loop (7) and ram (1)
/// major numbers.
const LSBLK_ARGS: [&str; 8] = ["-l", "-n", "-e", "7", "-e", "1", "-o", "NAME"];

// =============================================================================
// Snapshot
// =============================================================================

/// A point-in-time set of OS block device names (without `/dev/` prefix).
///
/// Names keep the enumeration order so diffs against a later snapshot
/// report new devices in the order the OS listed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceSnapshot {
    names: Vec<String>,
}

impl BlockDeviceSnapshot {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Parse `lsblk -l -n -o NAME` output into device names.
fn parse_device_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Enumerator
// =============================================================================

/// Lists OS block devices through the command runner.
pub struct BlockDeviceEnumerator {
    runner: Arc<dyn CommandRunner>,
}

impl BlockDeviceEnumerator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Take a snapshot of the currently visible block devices.
    pub async fn snapshot(&self) -> Result<BlockDeviceSnapshot> {
        let out = self.runner.run(Path::new(LSBLK), &LSBLK_ARGS).await?;
        let out = self.check_clean(out)?;
        let names = parse_device_names(&out.stdout);
        debug!(devices = ?names, "block device snapshot");
        Ok(BlockDeviceSnapshot { names })
    }

    /// Any diagnostics from lsblk make the enumeration untrustworthy.
    fn check_clean(&self, out: CommandOutput) -> Result<CommandOutput> {
        if !out.stderr.trim().is_empty() {
            return Err(Error::command_failed(LSBLK, out.code, &out.stderr));
        }
        out.check(LSBLK)
    }
}

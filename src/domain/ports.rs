//! Domain Ports - Core trait definitions for the RAID provisioner
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems. Backends implement [`RaidBackend`] against a concrete
//! management tool; [`CommandRunner`] isolates process spawning so backend
//! flows can be driven from recorded tool output in tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Physical Device References
// =============================================================================

/// Backend-specific locator for a physical disk slot.
///
/// Two colon-delimited notations occur: `enclosure:slot` (storcli) and
/// `channel:device` (arcconf). Software RAID uses raw OS device paths.
/// The reference is opaque except where set-membership comparison or
/// renotation for a command line is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalDeviceRef(String);

impl PhysicalDeviceRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw reference as passed on a command line.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a colon-delimited pair, e.g. `252:1` -> (`252`, `1`).
    pub fn split_pair(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl std::fmt::Display for PhysicalDeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PhysicalDeviceRef {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

// =============================================================================
// RAID Specification
// =============================================================================

/// Immutable description of the desired RAID configuration.
///
/// The device list must be non-empty; whether the list length is valid for
/// the requested level is validated upstream by the benchmarking harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaidSpec {
    /// RAID level (0, 1, 5, 6, 10, ...)
    pub level: u32,
    /// OS block device path the virtual drive must appear as (e.g. /dev/md0)
    pub device_path: PathBuf,
    /// Member physical devices, in the order handed to the tool
    pub devices: Vec<PhysicalDeviceRef>,
    /// Optional read policy token, passed through verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_policy: Option<String>,
    /// Optional write policy token, passed through verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_policy: Option<String>,
    /// Optional strip/stripe size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_size: Option<u32>,
}

impl RaidSpec {
    /// Check the invariants this layer owns.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::Configuration(
                "RAID spec has an empty device list".into(),
            ));
        }
        if self.device_path.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "RAID spec has an empty device path".into(),
            ));
        }
        Ok(())
    }

    /// The OS name of the target device, i.e. the path without `/dev/`.
    pub fn os_name(&self) -> Result<&str> {
        self.device_path
            .strip_prefix("/dev")
            .ok()
            .and_then(Path::to_str)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "device path {} is not under /dev",
                    self.device_path.display()
                ))
            })
    }
}

// =============================================================================
// Virtual Drive State
// =============================================================================

/// Readiness of a virtual drive, recomputed on each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    /// No initialization or rebuild activity observed
    Ready,
    /// Rebuild or initialization in progress
    Busy,
    /// No status line found for the drive; a parse coverage gap
    Unknown,
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessState::Ready => write!(f, "ready"),
            ReadinessState::Busy => write!(f, "busy"),
            ReadinessState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A provisioned virtual drive, created or discovered by a backend.
///
/// Owned exclusively by the backend instance that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDrive {
    /// Backend-specific identifier (e.g. `0/3` for storcli, `1` for arcconf,
    /// the array name for mdadm)
    pub id: String,
    /// Member physical devices
    pub devices: Vec<PhysicalDeviceRef>,
    /// Backing OS block device path
    pub device_path: PathBuf,
    /// Readiness at the time the drive was produced
    pub state: ReadinessState,
    /// When this drive was created or discovered
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Command Runner Port
// =============================================================================

/// Captured output of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Fail with [`Error::CommandFailed`] unless the exit code is zero.
    pub fn check(self, program: &str) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::command_failed(program, self.code, &self.stderr))
        }
    }
}

/// Port for external command execution.
///
/// Runs one program to completion and captures its output. Never retries,
/// never interprets the output. Non-zero exit codes are reported in the
/// returned [`CommandOutput`], not as errors; spawn failures are.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput>;
}

// =============================================================================
// RAID Backend Port
// =============================================================================

/// Port every RAID management backend implements.
///
/// A backend is constructed around one [`RaidSpec`] and used for exactly one
/// provisioning attempt. The only mutable state is the bound virtual-drive
/// identifier, written by discovery and creation and read by later health,
/// readiness and deletion calls. Commands are issued strictly one at a time.
#[async_trait]
pub trait RaidBackend: Send {
    /// Backend name for logs and error context.
    fn name(&self) -> &'static str;

    /// Locate the backend's administrative executable.
    async fn initialize(&mut self) -> Result<()>;

    /// Whether a virtual drive already serves the requested device set.
    ///
    /// Must not mutate controller state. Binds the matching identifier as a
    /// side effect when an existing drive is discovered.
    async fn path_exists(&mut self) -> Result<bool>;

    /// Enumerate configured virtual drive identifiers.
    ///
    /// Software RAID reports an empty list; arrays are observed through the
    /// OS device path directly.
    async fn list_virtual_drives(&self) -> Result<Vec<String>>;

    /// Provision a new virtual drive matching the spec.
    async fn create_virtual_drive(&mut self) -> Result<VirtualDrive>;

    /// Destroy the given virtual drive and release its physical devices.
    async fn delete_virtual_drive(&mut self, vd: &VirtualDrive) -> Result<()>;

    /// Whether initialization or rebuild activity is in progress.
    async fn is_ready(&self) -> Result<ReadinessState>;

    /// The currently bound virtual drive identifier, if any.
    fn bound_vd(&self) -> Option<&str>;
}

//! RAID Backend Adapters
//!
//! Provides adapters for the three supported RAID management tools:
//! - mdadm: Linux software RAID
//! - storcli: Broadcom/LSI MegaRAID controllers
//! - arcconf: Microchip/Adaptec controllers

pub mod arcconf;
pub mod mdadm;
pub mod storcli;

pub use arcconf::*;
pub use mdadm::*;
pub use storcli::*;

use crate::domain::ports::{CommandRunner, RaidBackend, RaidSpec};
use crate::error::{Error, Result};
use crate::reconcile::SettlePolicy;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration shared by all backend adapters.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Poll policy for post-creation device discovery
    pub settle: SettlePolicy,
    /// Hardware controller index (storcli `/cN`, arcconf controller number)
    pub controller: u32,
    /// Kernel software-RAID status file (overridable for testing)
    pub mdstat_path: PathBuf,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            settle: SettlePolicy::default(),
            controller: 0,
            mdstat_path: PathBuf::from("/proc/mdstat"),
        }
    }
}

// =============================================================================
// Backend Factory
// =============================================================================

/// Factory for creating RAID backend adapters.
///
/// A backend instance serves exactly one provisioning attempt for one spec;
/// construct a fresh one per attempt so no stale drive binding leaks across
/// unrelated runs.
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend adapter by name.
    pub fn create(
        name: &str,
        spec: RaidSpec,
        config: ProvisionerConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Box<dyn RaidBackend>> {
        spec.validate()?;
        match name.to_lowercase().as_str() {
            "mdadm" | "software" => Ok(Box::new(MdadmBackend::new(spec, config, runner))),
            "storcli" | "megaraid" => Ok(Box::new(StorcliBackend::new(spec, config, runner))),
            "arcconf" | "adaptec" => Ok(Box::new(ArcconfBackend::new(spec, config, runner))),
            _ => Err(Error::Configuration(format!(
                "unknown RAID backend: {name}"
            ))),
        }
    }
}

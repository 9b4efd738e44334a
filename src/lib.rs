//! RAID Provision - Virtual Drive Provisioning for Benchmark Hosts
//!
//! Provisions and tears down RAID virtual drives through the management
//! tool a host actually has: mdadm for Linux software RAID, storcli for
//! Broadcom/LSI MegaRAID controllers, arcconf for Microchip/Adaptec
//! controllers. Every tool is observed exclusively through its command
//! line output; there is no binary controller API in play.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Benchmark Harness                       │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ RaidSpec
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                       BackendFactory                         │
//! │   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐     │
//! │   │ MdadmBackend │   │StorcliBackend│   │ArcconfBackend│     │
//! │   └──────┬───────┘   └──────┬───────┘   └──────┬───────┘     │
//! │          └───────────┬──────┴──────────────────┘             │
//! │                      │ CommandRunner                         │
//! └──────────────────────┼───────────────────────────────────────┘
//!                        │
//! ┌──────────────────────┴───────────────────────────────────────┐
//! │       mdadm / storcli / arcconf / lsblk  (free-text CLI)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Creation never trusts a tool's claim about which drive it made: the
//! new virtual drive and its OS block device are resolved by diffing
//! before/after snapshots, and exactly one new block device matching the
//! requested path must appear ([`reconcile`]).
//!
//! # Modules
//!
//! - [`backends`]: mdadm, storcli and arcconf adapters plus the factory
//! - [`domain`]: Core types and the [`RaidBackend`]/[`CommandRunner`] ports
//! - [`exec`]: Tool discovery and process execution
//! - [`hardware`]: OS block device enumeration via lsblk
//! - [`reconcile`]: Snapshot diffing and the settle/poll policy
//! - [`error`]: Error types and handling

pub mod backends;
pub mod domain;
pub mod error;
pub mod exec;
pub mod hardware;
pub mod reconcile;

// Re-export commonly used types
pub use backends::{
    ArcconfBackend, BackendFactory, MdadmBackend, ProvisionerConfig, StorcliBackend,
};

pub use domain::ports::{
    CommandOutput, CommandRunner, PhysicalDeviceRef, RaidBackend, RaidSpec, ReadinessState,
    VirtualDrive,
};

pub use error::{Error, Result};

pub use exec::{locate_tool, SystemRunner};

pub use hardware::{BlockDeviceEnumerator, BlockDeviceSnapshot};

pub use reconcile::SettlePolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

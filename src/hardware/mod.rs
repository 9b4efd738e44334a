//! Hardware Module
//!
//! OS-level observation of storage hardware. Currently block device
//! enumeration; controller-specific state lives with each backend.

pub mod blockdev;

pub use blockdev::*;

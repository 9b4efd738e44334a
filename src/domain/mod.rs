//! Domain layer - Core data model and port definitions
//!
//! This module defines the core traits (ports) that backend adapters
//! implement, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;

//! Error types for the RAID provisioner
//!
//! Provides structured error types for all provisioner components:
//! tool discovery, external command execution, controller output
//! parsing, and post-creation reconciliation.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Tool Discovery Errors
    // =========================================================================
    #[error("Administrative tool not found: {tool}")]
    ToolNotFound { tool: String },

    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    #[error("Command failed: {program} exited with {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Unexpected output from {program}: {reason}")]
    Parse { program: String, reason: String },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    #[error("Timed out waiting for {what} after {attempts} attempts")]
    SettleTimeout { what: String, attempts: u32 },

    #[error("No virtual drive bound on {backend} backend")]
    NoBoundDrive { backend: String },

    // =========================================================================
    // Serialization / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a command failure from captured process output.
    pub fn command_failed(program: impl Into<String>, code: i32, stderr: &str) -> Self {
        Error::CommandFailed {
            program: program.into(),
            code,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Build a parse error for a given program's output.
    pub fn parse(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the whole provisioning attempt could help.
    ///
    /// Settle timeouts are races with the OS device enumeration; a fresh
    /// attempt may observe the device. Mismatches and parse failures mean
    /// controller state was misread and must never be retried blindly.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SettleTimeout { .. })
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

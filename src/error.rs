//! Error types for the pgbranch library
//!
//! This module defines all error types that can occur during pgbranch
//! operations. Validation errors (`InvalidName`, `AlreadyExists`, `NotFound`)
//! are detected before any mutation and carry enough context for the operator
//! to act on; backend errors wrap the underlying tool's message verbatim.

use thiserror::Error;

/// Type alias for Results in the pgbranch library
pub type Result<T> = std::result::Result<T, PgBranchError>;

/// Main error type for all pgbranch operations
#[derive(Debug, Error)]
pub enum PgBranchError {
    /// Dataset (snapshot or branch) not found in the backend
    #[error("not found: {0}")]
    NotFound(String),

    /// Target dataset already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Name fails the snapshot or branch grammar
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Node cannot be deleted while clones depend on it
    #[error("'{path}' has dependent clones: {}", .dependents.join(", "))]
    HasDependents {
        /// Path of the node that was about to be deleted
        path: String,
        /// Paths of the clones whose origin points at it
        dependents: Vec<String>,
    },

    /// Requested port is already in use
    #[error("port {0} is already in use")]
    PortUnavailable(u16),

    /// Requested port lies outside the configured range
    #[error("port {port} is outside the configured range {lo}-{hi}")]
    PortOutOfRange {
        /// The rejected port
        port: u16,
        /// Lower bound of the configured range
        lo: u16,
        /// Upper bound of the configured range
        hi: u16,
    },

    /// Every port in the configured range is in use
    #[error("no free ports in range {lo}-{hi}")]
    NoPortsAvailable {
        /// Lower bound of the configured range
        lo: u16,
        /// Upper bound of the configured range
        hi: u16,
    },

    /// Instance did not answer the readiness probe within the retry ceiling
    #[error("instance did not become ready within {seconds}s")]
    StartupTimeout {
        /// Total seconds waited before giving up
        seconds: u64,
    },

    /// Branch already has a live instance attached
    #[error("branch '{name}' already has a running instance on port {port}")]
    AlreadyRunning {
        /// Branch name
        name: String,
        /// Port the live instance answers on
        port: u16,
    },

    /// Branch creation asked for the latest snapshot but none exist
    #[error("no snapshots exist under {0}")]
    NoSnapshots(String),

    /// Resolved source snapshot does not exist
    #[error("source snapshot missing: {0}")]
    SourceMissing(String),

    /// Backend tool failure, message surfaced verbatim
    #[error("backend error: {0}")]
    Backend(String),

    /// Instance runtime failure (process or container)
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PgBranchError {
    /// Create a backend error with a custom message
    pub fn backend(msg: impl Into<String>) -> Self {
        PgBranchError::Backend(msg.into())
    }

    /// Create a runtime error with a custom message
    pub fn runtime(msg: impl Into<String>) -> Self {
        PgBranchError::Runtime(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        PgBranchError::Config(msg.into())
    }

    /// Create an invalid-name error with a custom reason
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PgBranchError::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a port conflict
    ///
    /// Covers both the allocator's own probe result and the bind failure an
    /// instance runtime reports when a port became busy between the probe and
    /// the bind. The branch manager re-runs allocation exactly once when it
    /// sees this on an auto-allocated port.
    pub fn is_port_conflict(&self) -> bool {
        match self {
            PgBranchError::PortUnavailable(_) => true,
            PgBranchError::Runtime(msg) | PgBranchError::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("address already in use") || msg.contains("port is already allocated")
            }
            _ => false,
        }
    }

    /// Check if this error left observable partial state behind
    ///
    /// True for failures that happen after the primary mutation succeeded,
    /// where re-entry on the next invocation is the recovery path.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            PgBranchError::StartupTimeout { .. } | PgBranchError::Runtime(_)
        )
    }
}

//! Core data types shared across the pgbranch library
//!
//! The types in this module represent:
//! - **Backend nodes**: [`DatasetNode`], [`SizeMetrics`] - what the
//!   copy-on-write store reports for each dataset
//! - **Instance state**: [`InstanceStatus`], [`StopMode`]
//! - **Persisted metadata**: the [`attr`] key constants stored as backend
//!   attributes (attributes are the only persistence mechanism; absence of a
//!   key is semantically "unset", never an error)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute keys persisted on backend nodes
///
/// Keys live in the `pgbranch:` user-property namespace so they survive next
/// to the backend's native properties without collisions.
pub mod attr {
    /// Logical branch name
    pub const BRANCH: &str = "pgbranch:branch";
    /// Informational parent-branch label (never validated for existence)
    pub const PARENT: &str = "pgbranch:parent";
    /// Full path of the origin snapshot a branch was cloned from
    pub const ORIGIN: &str = "pgbranch:origin";
    /// Creation timestamp, RFC 3339
    pub const CREATED: &str = "pgbranch:created";
    /// Free-text message attached at creation
    pub const MESSAGE: &str = "pgbranch:message";
    /// Port allocated to the branch's instance
    pub const PORT: &str = "pgbranch:port";
    /// Identifier of the attached instance (container name for the container
    /// runtime, data directory for the process runtime)
    pub const INSTANCE: &str = "pgbranch:instance";
}

/// Kind of node to enumerate from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    /// Immutable point-in-time nodes (`pool/data@name`)
    Snapshot,
    /// Writable nodes, including the pool root and branch clones
    Filesystem,
}

/// Size metrics reported by the backend for a dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeMetrics {
    /// Space consumed by this node and its descendants
    pub used: u64,
    /// Space available to this node
    pub available: u64,
    /// Space referenced by this node's data
    pub referenced: u64,
    /// Compression ratio achieved on this node
    pub compress_ratio: f64,
}

/// A node as enumerated by the dataset backend
///
/// `origin` is `None` for nodes that were not cloned from a snapshot; the
/// backend adapters convert the "empty string means unset" convention to an
/// `Option` exactly once, so nothing downstream re-interprets sentinels.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetNode {
    /// Full backend path, e.g. `dbpool/branches/feature`
    pub path: String,
    /// Origin snapshot path for clones
    pub origin: Option<String>,
    /// Backend-reported size metrics
    pub metrics: SizeMetrics,
    /// Backend-reported creation time
    pub creation: DateTime<Utc>,
}

/// Observed state of a database instance attached to a branch
///
/// The live probe is authoritative: a branch with a stored port attribute
/// whose probe reports nothing listening is `Stopped`, not `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Instance answers the liveness probe
    Running,
    /// No instance attached, or the stored port probes dead
    Stopped,
    /// State could not be determined
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Shutdown mode requested from an instance runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Orderly shutdown, waits for the instance to flush
    Graceful,
    /// Forceful shutdown, used when graceful fails or times out
    Immediate,
}

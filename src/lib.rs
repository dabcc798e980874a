//! # pgbranch - Git-like branching for PostgreSQL data directories
//!
//! pgbranch layers a branch/snapshot abstraction on top of copy-on-write
//! filesystem clones (ZFS in the reference deployment) and manages the
//! lifecycle of ephemeral database server instances bound to those clones.
//!
//! ## Overview
//!
//! Working with a multi-gigabyte data directory, pgbranch lets you:
//! - Take immutable snapshots of the primary data volume
//! - Branch a writable clone off any snapshot in seconds, with its own
//!   running database instance on its own port
//! - Snapshot branches themselves and branch again from those
//! - Delete nodes safely: deletion is refused while clones depend on them
//!
//! ## Architecture
//!
//! The versioned dataset graph is stored entirely in the backend: branches
//! and snapshots are datasets, lineage is the backend's clone-origin pointer,
//! and all other metadata lives in `pgbranch:` attributes on the nodes
//! themselves. There is no separate database and no in-memory cache that can
//! drift - every query recomputes its view from the backend, and the one
//! "soft" fact (the port recorded for a branch's instance) is always
//! reconciled against a live probe before it is believed.
//!
//! The tool is a short-lived process re-invoked per command. Operations are
//! written to tolerate re-entry after a partial failure: a branch dataset
//! with no port attribute is the canonical "created but not started" state,
//! recovered by `start_instance`, not by re-running `create`.
//!
//! ## Quick Start
//!
//! ```rust
//! use pgbranch::{
//!     BranchManager, Config, FakeRuntime, MemoryBackend, SnapshotManager,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> pgbranch::Result<()> {
//! let config = Config {
//!     start_poll_interval_ms: 0,
//!     ..Config::default()
//! };
//! // the in-memory collaborators stand in for ZFS and Postgres here;
//! // production wiring uses ZfsBackend, TcpProbe, and a real runtime
//! let backend = Arc::new(MemoryBackend::seeded(&config));
//! let runtime = FakeRuntime::new();
//!
//! let snapshots = SnapshotManager::new(config.clone(), backend.clone());
//! let branches = BranchManager::new(
//!     config,
//!     backend,
//!     runtime.probe(),
//!     Arc::new(runtime),
//! );
//!
//! snapshots.create("base", Some("initial import"))?;
//! let branch = branches.create("feature", None, None, None)?;
//! println!("branch {} running on port {:?}", branch.name, branch.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`config`]: configuration loading and merging
//! - [`naming`]: dataset path mapping and name grammars
//! - [`backend`]: the dataset backend interface, ZFS and in-memory
//! - [`ports`]: port allocation and liveness probing
//! - [`instance`]: instance runtimes and start/stop supervision
//! - [`snapshot`]: snapshot lifecycle
//! - [`branch`]: branch lifecycle and the dependency graph
//! - [`status`]: system-wide status aggregation
//! - [`error`]: error types and handling

// Public API modules
pub mod backend;
pub mod branch;
pub mod config;
pub mod error;
pub mod instance;
pub mod naming;
pub mod ports;
pub mod snapshot;
pub mod status;
pub mod types;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use backend::{DatasetBackend, MemoryBackend, ZfsBackend};
pub use branch::{BranchInfo, BranchManager};
pub use config::{Config, RuntimeKind, SnapshotPolicy};
pub use error::{PgBranchError, Result};
pub use instance::{
    DockerRuntime, FakeRuntime, InstanceManager, InstanceRuntime, PostgresRuntime,
};
pub use ports::{PortAllocator, PortProbe, TcpProbe};
pub use snapshot::{SnapshotInfo, SnapshotManager};
pub use status::{StatusAggregator, SystemReport};
pub use types::*;

//! System-wide status aggregation
//!
//! A read-only composition over the managers producing one consistent report
//! for the operator. The aggregator is not a source of truth: every value is
//! recomputed from the backend and live probes at report time.
//!
//! Independent sub-queries (pool health, runtime version, snapshot list,
//! branch list, host metrics) run in parallel. Any individual leg degrades to
//! a typed placeholder and logs a warning; the report itself only fails when
//! a structural dependency - the pool being reachable at all - is missing.

use crate::backend::DatasetBackend;
use crate::branch::{BranchInfo, BranchManager};
use crate::config::Config;
use crate::error::{PgBranchError, Result};
use crate::instance::InstanceRuntime;
use crate::ports::PortProbe;
use crate::snapshot::{SnapshotInfo, SnapshotManager};
use crate::types::{DatasetKind, InstanceStatus, SizeMetrics};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Placeholder for values a degraded sub-query could not produce
pub const UNKNOWN: &str = "UNKNOWN";

/// Host metrics captured alongside the report
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Architecture
    pub arch: String,
}

impl HostInfo {
    /// Capture the current host's information
    pub fn collect() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| UNKNOWN.to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Health and size of the copy-on-write pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Pool name
    pub name: String,
    /// Backend-reported health, `UNKNOWN` when unavailable
    pub health: String,
    /// Size metrics of the pool root
    pub metrics: SizeMetrics,
}

/// One consistent snapshot of the whole system
#[derive(Debug, Clone, Serialize)]
pub struct SystemReport {
    /// Pool health and size
    pub pool: PoolStatus,
    /// Instance runtime version, `UNKNOWN` when unavailable
    pub runtime_version: String,
    /// All snapshots under the pool
    pub snapshots: Vec<SnapshotInfo>,
    /// Total bytes consumed by snapshots
    pub snapshot_total_bytes: u64,
    /// All branches with their live status
    pub branches: Vec<BranchInfo>,
    /// Live-probed state of the primary database instance
    pub primary_status: InstanceStatus,
    /// Host metrics
    pub host: HostInfo,
    /// Derived judgment: pool online, primary running, and no branch in an
    /// unexpectedly inactive state
    pub healthy: bool,
}

/// Gathers the system report
pub struct StatusAggregator {
    config: Config,
    backend: Arc<dyn DatasetBackend>,
    probe: Arc<dyn PortProbe>,
    runtime: Arc<dyn InstanceRuntime>,
    snapshots: SnapshotManager,
    branches: BranchManager,
}

impl StatusAggregator {
    /// Create an aggregator over the same collaborators the managers use
    pub fn new(
        config: Config,
        backend: Arc<dyn DatasetBackend>,
        probe: Arc<dyn PortProbe>,
        runtime: Arc<dyn InstanceRuntime>,
    ) -> Self {
        let snapshots = SnapshotManager::new(config.clone(), backend.clone());
        let branches = BranchManager::new(
            config.clone(),
            backend.clone(),
            probe.clone(),
            runtime.clone(),
        );
        Self {
            config,
            backend,
            probe,
            runtime,
            snapshots,
            branches,
        }
    }

    /// Produce the report
    ///
    /// Fails only when the pool itself is unreachable; every other failure
    /// degrades the affected section.
    pub fn report(&self) -> Result<SystemReport> {
        if !self.backend.exists(&self.config.pool)? {
            return Err(PgBranchError::backend(format!(
                "pool {} is unreachable",
                self.config.pool
            )));
        }

        let ((pool, runtime_version), (snapshots, (branches, host))) = rayon::join(
            || rayon::join(|| self.pool_leg(), || self.version_leg()),
            || {
                rayon::join(
                    || self.snapshot_leg(),
                    || rayon::join(|| self.branch_leg(), HostInfo::collect),
                )
            },
        );

        let snapshot_total_bytes = snapshots.iter().map(|s| s.metrics.used).sum();
        let primary_status = if self.probe.is_free(self.config.primary_port) {
            InstanceStatus::Stopped
        } else {
            InstanceStatus::Running
        };
        let inactive_branches = branches
            .iter()
            .filter(|b| b.port.is_some() && b.status != InstanceStatus::Running)
            .count();
        let healthy = pool.health == "ONLINE"
            && primary_status == InstanceStatus::Running
            && inactive_branches == 0;

        Ok(SystemReport {
            pool,
            runtime_version,
            snapshots,
            snapshot_total_bytes,
            branches,
            primary_status,
            host,
            healthy,
        })
    }

    fn pool_leg(&self) -> PoolStatus {
        let health = match self.backend.get_attribute(&self.config.pool, "health") {
            Ok(Some(health)) => health,
            Ok(None) => UNKNOWN.to_string(),
            Err(e) => {
                warn!("pool health unavailable: {}", e);
                UNKNOWN.to_string()
            }
        };
        let metrics = match self
            .backend
            .list_nodes(DatasetKind::Filesystem, &self.config.pool)
        {
            Ok(nodes) => nodes
                .into_iter()
                .find(|n| n.path == self.config.pool)
                .map(|n| n.metrics)
                .unwrap_or_default(),
            Err(e) => {
                warn!("pool metrics unavailable: {}", e);
                SizeMetrics::default()
            }
        };
        PoolStatus {
            name: self.config.pool.clone(),
            health,
            metrics,
        }
    }

    fn version_leg(&self) -> String {
        self.runtime.version().unwrap_or_else(|e| {
            warn!("runtime version unavailable: {}", e);
            UNKNOWN.to_string()
        })
    }

    fn snapshot_leg(&self) -> Vec<SnapshotInfo> {
        self.snapshots.list().unwrap_or_else(|e| {
            warn!("snapshot listing unavailable: {}", e);
            Vec::new()
        })
    }

    fn branch_leg(&self) -> Vec<BranchInfo> {
        self.branches.list().unwrap_or_else(|e| {
            warn!("branch listing unavailable: {}", e);
            Vec::new()
        })
    }
}

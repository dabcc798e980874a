//! Branch lifecycle management
//!
//! A branch is a writable clone of a snapshot, optionally bound to a running
//! database instance. Per branch the states are:
//!
//! ```text
//! Absent -> Created(no instance) -> Running <-> Stopped -> Destroyed
//! ```
//!
//! Branch creation and instance startup are one logical operation, but the
//! clone is never rolled back when startup fails: the dataset's existence
//! plus the absence of a port attribute *is* the canonical "created but not
//! started" state, and the recovery path is re-entry (`start_instance`) on
//! the next invocation, not a transaction log.
//!
//! Attribute writes for "now running" happen only after a confirmed
//! successful start; clears happen unconditionally on stop attempts. That
//! ordering is what keeps a crashed instance from leaving a port attribute
//! that later invocations would trust.

use crate::backend::DatasetBackend;
use crate::config::{Config, SnapshotPolicy};
use crate::error::{PgBranchError, Result};
use crate::instance::{InstanceManager, InstanceRuntime};
use crate::naming;
use crate::ports::{PortAllocator, PortProbe};
use crate::types::{attr, DatasetKind, DatasetNode, InstanceStatus, SizeMetrics};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Read-model of one branch, composed from backend queries and live probes
#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    /// Logical branch name
    pub name: String,
    /// Full backend path
    pub path: String,
    /// Informational parent-branch label, empty when none was given
    pub parent: String,
    /// Full path of the origin snapshot this branch was cloned from
    pub origin: String,
    /// Creation time: the stamped attribute when present, else the
    /// backend-reported creation
    pub created: DateTime<Utc>,
    /// Backend-reported size metrics
    pub metrics: SizeMetrics,
    /// Child clones living under this branch's dataset subtree
    pub clones: Vec<String>,
    /// Port recorded for the attached instance
    pub port: Option<u16>,
    /// Identifier of the attached instance
    pub instance_id: Option<String>,
    /// Live-probed instance state; the probe wins over the stored port
    pub status: InstanceStatus,
}

/// Creates, deletes, lists, and inspects branches, and drives instance
/// start/stop as a side effect of branch create/delete
pub struct BranchManager {
    config: Config,
    backend: Arc<dyn DatasetBackend>,
    allocator: PortAllocator,
    instances: InstanceManager,
}

impl BranchManager {
    /// Create a manager wiring the backend, port probe, and instance runtime
    pub fn new(
        config: Config,
        backend: Arc<dyn DatasetBackend>,
        probe: Arc<dyn PortProbe>,
        runtime: Arc<dyn InstanceRuntime>,
    ) -> Self {
        let allocator = PortAllocator::new(&config, probe);
        let instances = InstanceManager::new(&config, runtime);
        Self {
            config,
            backend,
            allocator,
            instances,
        }
    }

    fn branch_path(&self, name: &str) -> String {
        naming::branch_path(&self.config.pool, &self.config.branches_subdir, name)
    }

    fn mount(&self, dataset: &str) -> PathBuf {
        naming::mount_path(&self.config.mount_root, &self.config.pool, dataset)
    }

    fn stored_port(&self, path: &str) -> Result<Option<u16>> {
        Ok(self
            .backend
            .get_attribute(path, attr::PORT)?
            .and_then(|raw| raw.parse().ok()))
    }

    /// Create a branch and start its instance
    ///
    /// The port is validated (or allocated) before anything is cloned, so an
    /// occupied explicit port fails with no dataset created. If the clone
    /// succeeds but instance startup fails, the error propagates and the
    /// branch remains in the created-but-not-started state - observable as a
    /// dataset with no port attribute.
    #[instrument(skip(self))]
    pub fn create(
        &self,
        name: &str,
        port: Option<u16>,
        source: Option<&str>,
        parent: Option<&str>,
    ) -> Result<BranchInfo> {
        naming::validate_branch_name(name, &self.config.branch_name_symbols)?;
        let path = self.branch_path(name);
        if self.backend.exists(&path)? {
            return Err(PgBranchError::AlreadyExists(path));
        }
        let origin = self.resolve_source(source)?;
        let explicit = port.is_some();
        let allocated = self.allocator.allocate(port)?;

        if let Err(e) = self.ensure_branches_root() {
            self.allocator.release(allocated);
            return Err(e);
        }
        if let Err(e) = DatasetBackend::clone_from(self.backend.as_ref(), &origin, &path) {
            self.allocator.release(allocated);
            return Err(e);
        }
        if let Err(e) = self.stamp_branch(&path, name, &origin, parent) {
            self.allocator.release(allocated);
            return Err(e);
        }
        info!("created branch {} from {}", name, origin);

        if let Err(e) = self.launch(&path, allocated, explicit) {
            warn!(
                "branch {} was created but its instance did not start: {}",
                name, e
            );
            return Err(e);
        }
        self.info(name)
    }

    /// Start an instance for an existing branch
    ///
    /// Returns the bound port and the instance identifier. Fails with
    /// [`PgBranchError::AlreadyRunning`] when the branch's stored port
    /// cross-checked against the live probe says an instance is already up.
    #[instrument(skip(self))]
    pub fn start_instance(&self, name: &str, port: Option<u16>) -> Result<(u16, String)> {
        let path = self.branch_path(name);
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        if let Some(stored) = self.stored_port(&path)? {
            if self.allocator.port_is_live(stored) {
                return Err(PgBranchError::AlreadyRunning {
                    name: name.to_string(),
                    port: stored,
                });
            }
            debug!(
                "branch {} has a stale port attribute {} (instance is dead)",
                name, stored
            );
        }
        let explicit = port.is_some();
        let allocated = self.allocator.allocate(port)?;
        self.launch(&path, allocated, explicit)
    }

    /// Launch over the branch mount and persist attributes after a confirmed
    /// start; one allocation retry covers the probe-to-bind race window
    fn launch(&self, path: &str, port: u16, explicit: bool) -> Result<(u16, String)> {
        let mount = self.mount(path);
        match self.instances.start(&mount, port) {
            Ok(id) => {
                self.persist_instance(path, port, &id)?;
                Ok((port, id))
            }
            Err(e) if e.is_port_conflict() && !explicit => {
                warn!(
                    "port {} was taken between probe and bind, re-running allocation once",
                    port
                );
                self.allocator.release(port);
                let retry = self.allocator.allocate(None)?;
                match self.instances.start(&mount, retry) {
                    Ok(id) => {
                        self.persist_instance(path, retry, &id)?;
                        Ok((retry, id))
                    }
                    Err(e) => {
                        self.allocator.release(retry);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.allocator.release(port);
                Err(e)
            }
        }
    }

    fn persist_instance(&self, path: &str, port: u16, id: &str) -> Result<()> {
        self.backend.set_attribute(path, attr::PORT, &port.to_string())?;
        self.backend.set_attribute(path, attr::INSTANCE, id)?;
        Ok(())
    }

    /// Stop a branch's instance
    ///
    /// A branch with no recorded port is already stopped; that is a no-op
    /// success. Stop failures are logged and do not prevent the port and
    /// instance attributes from being cleared - a stale attribute pointing at
    /// a dead instance is worse than a leaked process.
    #[instrument(skip(self))]
    pub fn stop_instance(&self, name: &str) -> Result<()> {
        let path = self.branch_path(name);
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        let port = match self.stored_port(&path)? {
            Some(port) => port,
            None => {
                debug!("branch {} has no instance attached", name);
                return Ok(());
            }
        };
        let id = self
            .backend
            .get_attribute(&path, attr::INSTANCE)?
            .unwrap_or_default();
        let mount = self.mount(&path);
        if let Err(e) = self.instances.stop(&id, &mount) {
            warn!("stopping instance of branch {} failed: {}", name, e);
        }
        self.backend.set_attribute(&path, attr::PORT, "")?;
        self.backend.set_attribute(&path, attr::INSTANCE, "")?;
        self.allocator.release(port);
        info!("stopped instance of branch {}", name);
        Ok(())
    }

    /// Delete a branch and its subtree
    ///
    /// Refused with [`PgBranchError::HasDependents`] while child clones live
    /// under the branch, unless forced. Stopping the attached instance is
    /// best-effort: a branch with a dead or unreachable instance must still
    /// be deletable.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        let path = self.branch_path(name);
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        let clones = self.child_clones(&path)?;
        if !clones.is_empty() && !force {
            return Err(PgBranchError::HasDependents {
                path,
                dependents: clones,
            });
        }
        if let Err(e) = self.stop_instance(name) {
            warn!(
                "could not stop instance of branch {} before delete: {}",
                name, e
            );
        }
        self.backend.destroy(&path, true)?;
        info!("deleted branch {}", name);
        Ok(())
    }

    /// Snapshot a branch's current state
    ///
    /// Returns the full path of the new snapshot, which can then be branched
    /// from or inspected like any other.
    #[instrument(skip(self, message))]
    pub fn snapshot_from(
        &self,
        branch: &str,
        snapshot: &str,
        message: Option<&str>,
    ) -> Result<String> {
        naming::validate_snapshot_name(snapshot)?;
        let path = self.branch_path(branch);
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        let snapshot_path = format!("{}@{}", path, snapshot);
        if self.backend.exists(&snapshot_path)? {
            return Err(PgBranchError::AlreadyExists(snapshot_path));
        }
        self.backend.create(&snapshot_path)?;
        self.backend
            .set_attribute(&snapshot_path, attr::CREATED, &Utc::now().to_rfc3339())?;
        self.backend
            .set_attribute(&snapshot_path, attr::BRANCH, branch)?;
        if let Some(message) = message {
            self.backend
                .set_attribute(&snapshot_path, attr::MESSAGE, message)?;
        }
        info!("created snapshot {} of branch {}", snapshot_path, branch);
        Ok(snapshot_path)
    }

    /// All branches under the branches root
    ///
    /// Nested path components and child clones are excluded: a branch is a
    /// node carrying the branch-name attribute.
    pub fn list(&self) -> Result<Vec<BranchInfo>> {
        let root = self.config.branches_dataset();
        if !self.backend.exists(&root)? {
            return Ok(Vec::new());
        }
        let mut branches = Vec::new();
        for node in self.backend.list_nodes(DatasetKind::Filesystem, &root)? {
            if node.path == root {
                continue;
            }
            if self.backend.get_attribute(&node.path, attr::BRANCH)?.is_none() {
                continue;
            }
            branches.push(self.build_info(node)?);
        }
        Ok(branches)
    }

    /// Inspect one branch by name
    pub fn info(&self, name: &str) -> Result<BranchInfo> {
        let path = self.branch_path(name);
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        let node = self
            .backend
            .list_nodes(DatasetKind::Filesystem, &path)?
            .into_iter()
            .find(|node| node.path == path)
            .ok_or_else(|| PgBranchError::NotFound(path.clone()))?;
        self.build_info(node)
    }

    fn build_info(&self, node: DatasetNode) -> Result<BranchInfo> {
        let path = node.path.clone();
        let root_prefix = format!("{}/", self.config.branches_dataset());
        let name = match self.backend.get_attribute(&path, attr::BRANCH)? {
            Some(name) => name,
            None => path.strip_prefix(&root_prefix).unwrap_or(&path).to_string(),
        };
        let parent = self
            .backend
            .get_attribute(&path, attr::PARENT)?
            .unwrap_or_default();
        let origin = match node.origin.clone() {
            Some(origin) => origin,
            None => self
                .backend
                .get_attribute(&path, attr::ORIGIN)?
                .unwrap_or_default(),
        };
        let created = self
            .backend
            .get_attribute(&path, attr::CREATED)?
            .and_then(|raw| utils::parse_timestamp(&raw))
            .unwrap_or(node.creation);
        let clones = self.child_clones(&path)?;
        let port = self.stored_port(&path)?;
        let instance_id = self.backend.get_attribute(&path, attr::INSTANCE)?;
        let status = match port {
            Some(port) if self.allocator.port_is_live(port) => InstanceStatus::Running,
            _ => InstanceStatus::Stopped,
        };
        Ok(BranchInfo {
            name,
            path,
            parent,
            origin,
            created,
            metrics: node.metrics,
            clones,
            port,
            instance_id,
            status,
        })
    }

    /// Datasets strictly below the branch path
    fn child_clones(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .backend
            .list_nodes(DatasetKind::Filesystem, path)?
            .into_iter()
            .filter(|node| node.path != path)
            .map(|node| node.path)
            .collect())
    }

    fn resolve_source(&self, source: Option<&str>) -> Result<String> {
        if let Some(name) = source {
            let path = naming::snapshot_path(&self.config.pool, &self.config.data_subdir, name)?;
            if !self.backend.exists(&path)? {
                return Err(PgBranchError::SourceMissing(path));
            }
            return Ok(path);
        }
        let primary = self.config.primary_dataset();
        match self.config.snapshot_policy {
            SnapshotPolicy::LatestCreated => {
                let prefix = format!("{}@", primary);
                let latest = self
                    .backend
                    .list_nodes(DatasetKind::Snapshot, &primary)?
                    .into_iter()
                    .filter(|node| node.path.starts_with(&prefix))
                    // later element wins ties, matching the backend's stable ordering
                    .fold(None::<DatasetNode>, |best, node| match best {
                        Some(best) if best.creation > node.creation => Some(best),
                        _ => Some(node),
                    });
                latest
                    .map(|node| node.path)
                    .ok_or(PgBranchError::NoSnapshots(primary))
            }
        }
    }

    /// Create the branches container dataset if missing
    ///
    /// Idempotent across racing invocations: "already exists" from a
    /// concurrent create is success.
    fn ensure_branches_root(&self) -> Result<()> {
        let root = self.config.branches_dataset();
        if self.backend.exists(&root)? {
            return Ok(());
        }
        match self.backend.create(&root) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.backend.exists(&root).unwrap_or(false) {
                    debug!("branches root {} was created concurrently", root);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn stamp_branch(
        &self,
        path: &str,
        name: &str,
        origin: &str,
        parent: Option<&str>,
    ) -> Result<()> {
        self.backend.set_attribute(path, attr::BRANCH, name)?;
        self.backend.set_attribute(path, attr::ORIGIN, origin)?;
        self.backend
            .set_attribute(path, attr::CREATED, &Utc::now().to_rfc3339())?;
        if let Some(parent) = parent {
            self.backend.set_attribute(path, attr::PARENT, parent)?;
        }
        Ok(())
    }
}

//! Snapshot lifecycle management
//!
//! Snapshots are immutable point-in-time nodes of the primary data volume
//! (or of a branch, see [`crate::branch::BranchManager::snapshot_from`]).
//! They are created explicitly by the operator or implicitly when branching,
//! and destruction is refused while any clone's origin points at them unless
//! the caller forces it - and even then the backend's own refusal, if it has
//! one, is surfaced verbatim rather than swallowed.

use crate::backend::DatasetBackend;
use crate::config::Config;
use crate::error::{PgBranchError, Result};
use crate::naming;
use crate::types::{attr, DatasetKind, DatasetNode, SizeMetrics};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Read-model of one snapshot, composed from backend queries
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    /// Bare snapshot name (the part after `@`)
    pub name: String,
    /// Full backend path
    pub path: String,
    /// Creation time: the stamped attribute when present, else the
    /// backend-reported creation
    pub created: DateTime<Utc>,
    /// Free-text message, empty when none was attached
    pub message: String,
    /// Backend-reported size metrics
    pub metrics: SizeMetrics,
    /// Paths of clones whose origin is this snapshot
    pub clones: Vec<String>,
}

/// Creates, deletes, lists, and inspects snapshots
pub struct SnapshotManager {
    config: Config,
    backend: Arc<dyn DatasetBackend>,
}

impl SnapshotManager {
    /// Create a manager over the given backend
    pub fn new(config: Config, backend: Arc<dyn DatasetBackend>) -> Self {
        Self { config, backend }
    }

    /// Create a snapshot of the primary data volume
    #[instrument(skip(self, message))]
    pub fn create(&self, name: &str, message: Option<&str>) -> Result<SnapshotInfo> {
        naming::validate_snapshot_name(name)?;
        let primary = self.config.primary_dataset();
        if !self.backend.exists(&primary)? {
            return Err(PgBranchError::SourceMissing(primary));
        }
        let path = format!("{}@{}", primary, name);
        if self.backend.exists(&path)? {
            return Err(PgBranchError::AlreadyExists(path));
        }
        self.backend.create(&path)?;
        self.backend
            .set_attribute(&path, attr::CREATED, &Utc::now().to_rfc3339())?;
        if let Some(message) = message {
            self.backend.set_attribute(&path, attr::MESSAGE, message)?;
        }
        info!("created snapshot {}", path);
        self.info(&path)
    }

    /// Resolve a bare or qualified snapshot name to its full path
    pub fn resolve(&self, name: &str) -> Result<String> {
        naming::snapshot_path(&self.config.pool, &self.config.data_subdir, name)
    }

    /// Delete a snapshot
    ///
    /// Refused with [`PgBranchError::HasDependents`] while any clone's origin
    /// points at it, unless `force` is set. Force skips this check only; the
    /// backend may still refuse on its own and that error propagates.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        let path = self.resolve(name)?;
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        let dependents = self.dependents_of(&path)?;
        if !dependents.is_empty() {
            if !force {
                return Err(PgBranchError::HasDependents { path, dependents });
            }
            warn!(
                "force-deleting {} despite {} dependent clone(s)",
                path,
                dependents.len()
            );
        }
        self.backend.destroy(&path, false)?;
        info!("deleted snapshot {}", path);
        Ok(())
    }

    /// Clones whose recorded origin equals `path`
    pub fn dependents_of(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .backend
            .list_nodes(DatasetKind::Filesystem, &self.config.pool)?
            .into_iter()
            .filter(|node| node.origin.as_deref() == Some(path))
            .map(|node| node.path)
            .collect())
    }

    /// All snapshots under the pool, branch snapshots included
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        self.backend
            .list_nodes(DatasetKind::Snapshot, &self.config.pool)?
            .into_iter()
            .map(|node| self.build_info(node))
            .collect()
    }

    /// Inspect one snapshot by bare or qualified name
    pub fn info(&self, name: &str) -> Result<SnapshotInfo> {
        let path = self.resolve(name)?;
        if !self.backend.exists(&path)? {
            return Err(PgBranchError::NotFound(path));
        }
        let filesystem = path.split('@').next().unwrap_or(&path).to_string();
        let node = self
            .backend
            .list_nodes(DatasetKind::Snapshot, &filesystem)?
            .into_iter()
            .find(|node| node.path == path)
            .ok_or(PgBranchError::NotFound(path))?;
        self.build_info(node)
    }

    fn build_info(&self, node: DatasetNode) -> Result<SnapshotInfo> {
        let message = self
            .backend
            .get_attribute(&node.path, attr::MESSAGE)?
            .unwrap_or_default();
        let created = self
            .backend
            .get_attribute(&node.path, attr::CREATED)?
            .and_then(|raw| utils::parse_timestamp(&raw))
            .unwrap_or(node.creation);
        let clones = self.dependents_of(&node.path)?;
        let name = node
            .path
            .rsplit('@')
            .next()
            .unwrap_or(node.path.as_str())
            .to_string();
        Ok(SnapshotInfo {
            name,
            path: node.path,
            created,
            message,
            metrics: node.metrics,
            clones,
        })
    }
}

//! Configuration loading and merging
//!
//! A [`Config`] is loaded once per invocation and threaded explicitly into
//! every manager's constructor. There is deliberately no process-wide mutable
//! configuration singleton, so tests can run with distinct configurations in
//! isolation.
//!
//! Values come from a JSON file merged over compiled defaults: every field is
//! optional in the file, and an absent field falls back to its default. An
//! explicitly passed path must exist; the well-known locations
//! (`./pgbranch.json`, then `$HOME/.config/pgbranch/config.json`) are
//! optional.

use crate::error::{PgBranchError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which instance runtime launches database servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Managed containers (`docker run` with the configured image)
    Docker,
    /// Local subprocesses (`pg_ctl` from the configured binary directory)
    Postgres,
}

/// Policy for resolving the source snapshot when branch creation does not
/// name one explicitly
///
/// "Latest" is ambiguous once branches produce snapshots in parallel
/// lineages, so the fallback is a named policy rather than a hard-coded rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotPolicy {
    /// Most recent snapshot of the primary dataset by backend creation time,
    /// last wins on ties
    LatestCreated,
}

/// Read-only configuration for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the copy-on-write pool
    pub pool: String,
    /// Subdirectory of the pool holding the primary data volume
    pub data_subdir: String,
    /// Subdirectory of the pool holding branch clones
    pub branches_subdir: String,
    /// Host filesystem root under which pool datasets are mounted
    pub mount_root: PathBuf,
    /// First port of the allocatable range (inclusive)
    pub port_range_start: u16,
    /// Last port of the allocatable range (inclusive)
    pub port_range_end: u16,
    /// Port the primary (non-branch) database instance listens on
    pub primary_port: u16,
    /// Instance runtime selection
    pub runtime: RuntimeKind,
    /// Container image for the docker runtime
    pub image: String,
    /// Directory holding `pg_ctl`/`pg_isready` for the process runtime
    pub pg_bin_dir: PathBuf,
    /// Readiness probe retry ceiling
    pub start_poll_attempts: u32,
    /// Readiness probe interval in milliseconds
    pub start_poll_interval_ms: u64,
    /// Source-snapshot resolution policy for branch creation
    pub snapshot_policy: SnapshotPolicy,
    /// Punctuation permitted in branch names besides letters and digits
    pub branch_name_symbols: Vec<char>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: "dbpool".to_string(),
            data_subdir: "data".to_string(),
            branches_subdir: "branches".to_string(),
            mount_root: PathBuf::from("/var/lib/pgbranch"),
            port_range_start: 6000,
            port_range_end: 6099,
            primary_port: 5432,
            runtime: RuntimeKind::Docker,
            image: "postgres:16".to_string(),
            pg_bin_dir: PathBuf::from("/usr/lib/postgresql/16/bin"),
            start_poll_attempts: 30,
            start_poll_interval_ms: 1000,
            snapshot_policy: SnapshotPolicy::LatestCreated,
            branch_name_symbols: vec!['-', '_', '/'],
        }
    }
}

impl Config {
    /// Load configuration for this invocation
    ///
    /// An explicit `path` must exist and parse; without one, the well-known
    /// locations are tried in order and silently skipped when absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        for candidate in Self::default_locations() {
            if candidate.is_file() {
                return Self::from_file(&candidate);
            }
        }
        debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PgBranchError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            PgBranchError::config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from("pgbranch.json")];
        if let Ok(home) = std::env::var("HOME") {
            locations.push(PathBuf::from(home).join(".config/pgbranch/config.json"));
        }
        locations
    }

    /// Check structural invariants the rest of the system relies on
    pub fn validate(&self) -> Result<()> {
        if self.pool.is_empty() || self.pool.contains('/') {
            return Err(PgBranchError::config("pool must be a non-empty top-level name"));
        }
        if self.data_subdir.is_empty() || self.branches_subdir.is_empty() {
            return Err(PgBranchError::config("data_subdir and branches_subdir must be non-empty"));
        }
        if self.data_subdir == self.branches_subdir {
            return Err(PgBranchError::config(
                "data_subdir and branches_subdir must differ",
            ));
        }
        if self.port_range_start > self.port_range_end {
            return Err(PgBranchError::config(format!(
                "port range {}-{} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        Ok(())
    }

    /// Full path of the primary data dataset, e.g. `dbpool/data`
    pub fn primary_dataset(&self) -> String {
        format!("{}/{}", self.pool, self.data_subdir)
    }

    /// Full path of the branches container dataset, e.g. `dbpool/branches`
    pub fn branches_dataset(&self) -> String {
        format!("{}/{}", self.pool, self.branches_subdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.primary_dataset(), "dbpool/data");
        assert_eq!(config.branches_dataset(), "dbpool/branches");
        assert_eq!(config.runtime, RuntimeKind::Docker);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_merges_over_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pool": "tank", "port_range_start": 7000, "port_range_end": 7010, "runtime": "postgres"}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pool, "tank");
        assert_eq!(config.port_range_start, 7000);
        assert_eq!(config.runtime, RuntimeKind::Postgres);
        // untouched fields keep their defaults
        assert_eq!(config.data_subdir, "data");
        assert_eq!(config.primary_port, 5432);
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let err = Config::from_file(Path::new("/nonexistent/pgbranch.json")).unwrap_err();
        assert!(matches!(err, PgBranchError::Config(_)));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"port_range_start": 7000, "port_range_end": 6000}}"#).unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, PgBranchError::Config(_)));
    }

    #[test]
    fn test_garbage_json_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}

//! Dataset backend adapter
//!
//! The core never shells out directly; every mutation of the copy-on-write
//! store goes through the [`DatasetBackend`] trait. Two implementations are
//! provided:
//!
//! - [`ZfsBackend`] invokes the `zfs`/`zpool` command-line tools with their
//!   machine-readable flags (`-H` for tab-separated output, `-p` for exact
//!   numbers) and parses the stable output format.
//! - [`MemoryBackend`] models the same semantics in memory, including clone
//!   origin tracking and the backend's own refusal to destroy a snapshot that
//!   still has dependent clones. It lets the entire lifecycle state machine
//!   run in tests without a real pool.
//!
//! The "empty string means unset" convention of attribute storage is
//! converted to `Option` here, exactly once; internal logic never
//! re-interprets sentinel strings.

use crate::config::Config;
use crate::error::{PgBranchError, Result};
use crate::types::{DatasetKind, DatasetNode, SizeMetrics};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, trace};

/// Interface to the copy-on-write dataset store
///
/// Implementations own all on-volume state; the managers recompute their view
/// by querying this interface rather than caching it.
pub trait DatasetBackend: Send + Sync {
    /// Check whether a dataset (filesystem or snapshot) exists
    fn exists(&self, path: &str) -> Result<bool>;

    /// Create a filesystem (parents included) or, for paths containing `@`,
    /// a snapshot of an existing filesystem
    fn create(&self, path: &str) -> Result<()>;

    /// Destroy a dataset, optionally with everything beneath it
    fn destroy(&self, path: &str, recursive: bool) -> Result<()>;

    /// Clone a snapshot into a new writable filesystem
    fn clone_from(&self, origin: &str, new_path: &str) -> Result<()>;

    /// Set an attribute on a dataset; an empty value unsets the attribute
    fn set_attribute(&self, path: &str, key: &str, value: &str) -> Result<()>;

    /// Read an attribute from a dataset; `None` when unset
    fn get_attribute(&self, path: &str, key: &str) -> Result<Option<String>>;

    /// Enumerate datasets of the given kind at or below `root`
    fn list_nodes(&self, kind: DatasetKind, root: &str) -> Result<Vec<DatasetNode>>;
}

// ---------------------------------------------------------------------------
// ZFS implementation
// ---------------------------------------------------------------------------

/// Backend implementation driving the `zfs` and `zpool` command-line tools
#[derive(Debug, Clone)]
pub struct ZfsBackend {
    zfs: PathBuf,
    zpool: PathBuf,
}

impl Default for ZfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsBackend {
    /// Create a backend using `zfs` and `zpool` from `$PATH`
    pub fn new() -> Self {
        Self {
            zfs: PathBuf::from("zfs"),
            zpool: PathBuf::from("zpool"),
        }
    }

    /// Create a backend with explicit tool locations
    pub fn with_binaries(zfs: PathBuf, zpool: PathBuf) -> Self {
        Self { zfs, zpool }
    }

    fn run(&self, bin: &PathBuf, args: &[&str]) -> Result<String> {
        trace!("exec {:?} {:?}", bin, args);
        let output = Command::new(bin).args(args).output().map_err(|e| {
            PgBranchError::backend(format!("failed to execute {}: {}", bin.display(), e))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PgBranchError::Backend(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DatasetBackend for ZfsBackend {
    fn exists(&self, path: &str) -> Result<bool> {
        match self.run(&self.zfs, &["list", "-H", "-t", "all", "-o", "name", path]) {
            Ok(_) => Ok(true),
            Err(PgBranchError::Backend(msg)) if msg.contains("does not exist") => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create(&self, path: &str) -> Result<()> {
        if path.contains('@') {
            self.run(&self.zfs, &["snapshot", path])?;
        } else {
            self.run(&self.zfs, &["create", "-p", path])?;
        }
        debug!("created {}", path);
        Ok(())
    }

    fn destroy(&self, path: &str, recursive: bool) -> Result<()> {
        if recursive {
            self.run(&self.zfs, &["destroy", "-r", path])?;
        } else {
            self.run(&self.zfs, &["destroy", path])?;
        }
        debug!("destroyed {}", path);
        Ok(())
    }

    fn clone_from(&self, origin: &str, new_path: &str) -> Result<()> {
        self.run(&self.zfs, &["clone", origin, new_path])?;
        debug!("cloned {} -> {}", origin, new_path);
        Ok(())
    }

    fn set_attribute(&self, path: &str, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            // unsetting a user property is `zfs inherit`
            self.run(&self.zfs, &["inherit", key, path])?;
        } else {
            let assignment = format!("{}={}", key, value);
            self.run(&self.zfs, &["set", assignment.as_str(), path])?;
        }
        Ok(())
    }

    fn get_attribute(&self, path: &str, key: &str) -> Result<Option<String>> {
        // pool-level properties (health, size) live on the zpool, not on a
        // dataset; route them to the pool tool when the path is the pool root
        let raw = if key == "health" && !path.contains('/') {
            self.run(&self.zpool, &["get", "-H", "-o", "value", key, path])?
        } else {
            self.run(&self.zfs, &["get", "-H", "-o", "value", key, path])?
        };
        let value = raw.trim();
        if value.is_empty() || value == "-" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    fn list_nodes(&self, kind: DatasetKind, root: &str) -> Result<Vec<DatasetNode>> {
        let type_arg = match kind {
            DatasetKind::Snapshot => "snapshot",
            DatasetKind::Filesystem => "filesystem",
        };
        let raw = self.run(
            &self.zfs,
            &[
                "list",
                "-H",
                "-p",
                "-t",
                type_arg,
                "-r",
                "-o",
                "name,origin,used,avail,refer,compressratio,creation",
                root,
            ],
        )?;
        raw.lines().map(parse_node_line).collect()
    }
}

/// Parse one tab-separated line of `zfs list -H -p` output
fn parse_node_line(line: &str) -> Result<DatasetNode> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 7 {
        return Err(PgBranchError::backend(format!(
            "unexpected zfs list output: '{}'",
            line
        )));
    }
    let origin = match fields[1] {
        "" | "-" => None,
        value => Some(value.to_string()),
    };
    Ok(DatasetNode {
        path: fields[0].to_string(),
        origin,
        metrics: SizeMetrics {
            used: parse_size(fields[2]),
            available: parse_size(fields[3]),
            referenced: parse_size(fields[4]),
            compress_ratio: fields[5].trim_end_matches('x').parse().unwrap_or(1.0),
        },
        creation: fields[6]
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now),
    })
}

fn parse_size(field: &str) -> u64 {
    // snapshots report "-" for avail
    field.parse().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemNode {
    kind: DatasetKind,
    origin: Option<String>,
    attrs: BTreeMap<String, String>,
    creation: DateTime<Utc>,
    metrics: SizeMetrics,
}

/// In-memory dataset store with the same observable semantics as ZFS
///
/// Creation times are a monotonic logical clock, so "latest snapshot"
/// ordering is deterministic in tests.
pub struct MemoryBackend {
    nodes: RwLock<BTreeMap<String, MemNode>>,
    ticks: Mutex<i64>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            ticks: Mutex::new(0),
        }
    }

    /// Create a store pre-seeded with the pool root and primary dataset
    pub fn seeded(config: &Config) -> Self {
        let backend = Self::new();
        backend.insert_filesystem(&config.pool);
        backend.insert_filesystem(&config.primary_dataset());
        backend
    }

    fn next_creation(&self) -> DateTime<Utc> {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        DateTime::from_timestamp(*ticks, 0).unwrap_or_else(Utc::now)
    }

    fn insert_filesystem(&self, path: &str) {
        let creation = self.next_creation();
        self.nodes.write().entry(path.to_string()).or_insert(MemNode {
            kind: DatasetKind::Filesystem,
            origin: None,
            attrs: BTreeMap::new(),
            creation,
            metrics: synthetic_metrics(),
        });
    }

    fn create_parents(&self, path: &str) {
        let mut prefix = String::new();
        for component in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            if prefix != path {
                self.insert_filesystem(&prefix);
            }
        }
    }

    /// Paths strictly below `path` (child filesystems and snapshots)
    fn descendants(nodes: &BTreeMap<String, MemNode>, path: &str) -> Vec<String> {
        let fs_prefix = format!("{}/", path);
        let snap_prefix = format!("{}@", path);
        nodes
            .keys()
            .filter(|k| k.starts_with(&fs_prefix) || k.starts_with(&snap_prefix))
            .cloned()
            .collect()
    }
}

impl DatasetBackend for MemoryBackend {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.nodes.read().contains_key(path))
    }

    fn create(&self, path: &str) -> Result<()> {
        if self.nodes.read().contains_key(path) {
            return Err(PgBranchError::backend(format!(
                "cannot create '{}': dataset already exists",
                path
            )));
        }
        if let Some((filesystem, _)) = path.split_once('@') {
            if !self.nodes.read().contains_key(filesystem) {
                return Err(PgBranchError::backend(format!(
                    "cannot open '{}': dataset does not exist",
                    filesystem
                )));
            }
            let creation = self.next_creation();
            self.nodes.write().insert(
                path.to_string(),
                MemNode {
                    kind: DatasetKind::Snapshot,
                    origin: None,
                    attrs: BTreeMap::new(),
                    creation,
                    metrics: synthetic_metrics(),
                },
            );
        } else {
            self.create_parents(path);
            self.insert_filesystem(path);
        }
        Ok(())
    }

    fn destroy(&self, path: &str, recursive: bool) -> Result<()> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(path) {
            return Err(PgBranchError::backend(format!(
                "cannot destroy '{}': dataset does not exist",
                path
            )));
        }
        if path.contains('@') {
            // the store itself refuses to destroy a snapshot with clones,
            // independent of any dependency checks done above it
            let dependents: Vec<String> = nodes
                .iter()
                .filter(|(_, n)| n.origin.as_deref() == Some(path))
                .map(|(k, _)| k.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(PgBranchError::backend(format!(
                    "cannot destroy '{}': snapshot has dependent clones: {}",
                    path,
                    dependents.join(", ")
                )));
            }
            nodes.remove(path);
            return Ok(());
        }

        let descendants = Self::descendants(&nodes, path);
        if !recursive && !descendants.is_empty() {
            return Err(PgBranchError::backend(format!(
                "cannot destroy '{}': filesystem has children",
                path
            )));
        }
        // clones hanging off snapshots inside the subtree but living outside
        // it keep the subtree alive
        for snapshot in descendants.iter().filter(|d| d.contains('@')) {
            let outside: Vec<&String> = nodes
                .iter()
                .filter(|(k, n)| {
                    n.origin.as_deref() == Some(snapshot.as_str())
                        && !k.starts_with(&format!("{}/", path))
                })
                .map(|(k, _)| k)
                .collect();
            if !outside.is_empty() {
                return Err(PgBranchError::backend(format!(
                    "cannot destroy '{}': snapshot {} has dependent clones",
                    path, snapshot
                )));
            }
        }
        for descendant in descendants {
            nodes.remove(&descendant);
        }
        nodes.remove(path);
        Ok(())
    }

    fn clone_from(&self, origin: &str, new_path: &str) -> Result<()> {
        {
            let nodes = self.nodes.read();
            match nodes.get(origin) {
                None => {
                    return Err(PgBranchError::backend(format!(
                        "cannot open '{}': dataset does not exist",
                        origin
                    )))
                }
                Some(node) if node.kind != DatasetKind::Snapshot => {
                    return Err(PgBranchError::backend(format!(
                        "cannot clone '{}': not a snapshot",
                        origin
                    )))
                }
                Some(_) => {}
            }
            if nodes.contains_key(new_path) {
                return Err(PgBranchError::backend(format!(
                    "cannot create '{}': dataset already exists",
                    new_path
                )));
            }
        }
        self.create_parents(new_path);
        let creation = self.next_creation();
        self.nodes.write().insert(
            new_path.to_string(),
            MemNode {
                kind: DatasetKind::Filesystem,
                origin: Some(origin.to_string()),
                attrs: BTreeMap::new(),
                creation,
                metrics: synthetic_metrics(),
            },
        );
        Ok(())
    }

    fn set_attribute(&self, path: &str, key: &str, value: &str) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(path).ok_or_else(|| {
            PgBranchError::backend(format!(
                "cannot set property on '{}': dataset does not exist",
                path
            ))
        })?;
        if value.is_empty() {
            node.attrs.remove(key);
        } else {
            node.attrs.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn get_attribute(&self, path: &str, key: &str) -> Result<Option<String>> {
        let nodes = self.nodes.read();
        let node = nodes.get(path).ok_or_else(|| {
            PgBranchError::backend(format!(
                "cannot get property of '{}': dataset does not exist",
                path
            ))
        })?;
        Ok(node.attrs.get(key).filter(|v| !v.is_empty()).cloned())
    }

    fn list_nodes(&self, kind: DatasetKind, root: &str) -> Result<Vec<DatasetNode>> {
        let nodes = self.nodes.read();
        let fs_prefix = format!("{}/", root);
        let snap_prefix = format!("{}@", root);
        let result = nodes
            .iter()
            .filter(|(path, node)| {
                if node.kind != kind {
                    return false;
                }
                match kind {
                    DatasetKind::Filesystem => {
                        path.as_str() == root || path.starts_with(&fs_prefix)
                    }
                    DatasetKind::Snapshot => {
                        path.starts_with(&snap_prefix) || path.starts_with(&fs_prefix)
                    }
                }
            })
            .map(|(path, node)| DatasetNode {
                path: path.clone(),
                origin: node.origin.clone(),
                metrics: node.metrics,
                creation: node.creation,
            })
            .collect();
        Ok(result)
    }
}

fn synthetic_metrics() -> SizeMetrics {
    SizeMetrics {
        used: 8192,
        available: 1 << 30,
        referenced: 8192,
        compress_ratio: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_line() {
        let line = "dbpool/branches/x\tdbpool/data@base\t8192\t1073741824\t8192\t1.23\t1700000000";
        let node = parse_node_line(line).unwrap();
        assert_eq!(node.path, "dbpool/branches/x");
        assert_eq!(node.origin.as_deref(), Some("dbpool/data@base"));
        assert_eq!(node.metrics.used, 8192);
        assert_eq!(node.metrics.compress_ratio, 1.23);
        assert_eq!(node.creation.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_node_line_snapshot_placeholders() {
        let line = "dbpool/data@base\t-\t0\t-\t8192\t1.00x\t1700000001";
        let node = parse_node_line(line).unwrap();
        assert_eq!(node.origin, None);
        assert_eq!(node.metrics.available, 0);
        assert_eq!(node.metrics.compress_ratio, 1.0);
    }

    #[test]
    fn test_parse_node_line_malformed() {
        assert!(parse_node_line("too\tfew\tfields").is_err());
    }

    #[test]
    fn test_memory_create_and_exists() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/data").unwrap();
        assert!(backend.exists("dbpool/data").unwrap());
        assert!(backend.exists("dbpool").unwrap()); // parent created implicitly
        assert!(!backend.exists("dbpool/other").unwrap());
        assert!(backend.create("dbpool/data").is_err());
    }

    #[test]
    fn test_memory_snapshot_requires_filesystem() {
        let backend = MemoryBackend::new();
        assert!(backend.create("dbpool/data@base").is_err());
        backend.create("dbpool/data").unwrap();
        backend.create("dbpool/data@base").unwrap();
        assert!(backend.exists("dbpool/data@base").unwrap());
    }

    #[test]
    fn test_memory_clone_tracks_origin() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/data").unwrap();
        backend.create("dbpool/data@base").unwrap();
        backend.clone_from("dbpool/data@base", "dbpool/branches/x").unwrap();

        let clones = backend.list_nodes(DatasetKind::Filesystem, "dbpool").unwrap();
        let clone = clones.iter().find(|n| n.path == "dbpool/branches/x").unwrap();
        assert_eq!(clone.origin.as_deref(), Some("dbpool/data@base"));

        // cloning from a filesystem is refused
        assert!(backend.clone_from("dbpool/data", "dbpool/branches/y").is_err());
    }

    #[test]
    fn test_memory_destroy_refuses_snapshot_with_clones() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/data").unwrap();
        backend.create("dbpool/data@base").unwrap();
        backend.clone_from("dbpool/data@base", "dbpool/branches/x").unwrap();

        let err = backend.destroy("dbpool/data@base", false).unwrap_err();
        assert!(err.to_string().contains("dependent clones"));

        backend.destroy("dbpool/branches/x", true).unwrap();
        backend.destroy("dbpool/data@base", false).unwrap();
    }

    #[test]
    fn test_memory_destroy_recursive() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/branches/x").unwrap();
        backend.create("dbpool/branches/x@s1").unwrap();
        backend.create("dbpool/branches/x/nested").unwrap();

        assert!(backend.destroy("dbpool/branches/x", false).is_err());
        backend.destroy("dbpool/branches/x", true).unwrap();
        assert!(!backend.exists("dbpool/branches/x@s1").unwrap());
        assert!(!backend.exists("dbpool/branches/x/nested").unwrap());
    }

    #[test]
    fn test_memory_attributes_roundtrip() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/data").unwrap();
        assert_eq!(backend.get_attribute("dbpool/data", "pgbranch:port").unwrap(), None);

        backend.set_attribute("dbpool/data", "pgbranch:port", "6001").unwrap();
        assert_eq!(
            backend.get_attribute("dbpool/data", "pgbranch:port").unwrap().as_deref(),
            Some("6001")
        );

        // empty value unsets
        backend.set_attribute("dbpool/data", "pgbranch:port", "").unwrap();
        assert_eq!(backend.get_attribute("dbpool/data", "pgbranch:port").unwrap(), None);

        assert!(backend.get_attribute("dbpool/missing", "k").is_err());
    }

    #[test]
    fn test_memory_list_nodes_scoping() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/data").unwrap();
        backend.create("dbpool/data@s1").unwrap();
        backend.create("dbpool/branches/a").unwrap();
        backend.create("dbpool/branches/a@s2").unwrap();

        let snaps = backend.list_nodes(DatasetKind::Snapshot, "dbpool/data").unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].path, "dbpool/data@s1");

        let all_snaps = backend.list_nodes(DatasetKind::Snapshot, "dbpool").unwrap();
        assert_eq!(all_snaps.len(), 2);

        let filesystems = backend.list_nodes(DatasetKind::Filesystem, "dbpool/branches").unwrap();
        let paths: Vec<&str> = filesystems.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["dbpool/branches", "dbpool/branches/a"]);
    }

    #[test]
    fn test_memory_creation_ordering_is_monotonic() {
        let backend = MemoryBackend::new();
        backend.create("dbpool/data").unwrap();
        backend.create("dbpool/data@first").unwrap();
        backend.create("dbpool/data@second").unwrap();

        let snaps = backend.list_nodes(DatasetKind::Snapshot, "dbpool/data").unwrap();
        let first = snaps.iter().find(|n| n.path.ends_with("@first")).unwrap();
        let second = snaps.iter().find(|n| n.path.ends_with("@second")).unwrap();
        assert!(second.creation > first.creation);
    }
}

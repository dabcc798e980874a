//! Dataset naming and name grammars
//!
//! Pure, total functions mapping logical names to backend paths and host
//! mount paths. No I/O happens here; the only failures are malformed names.
//!
//! Two grammars apply:
//!
//! - **Snapshot names** are deliberately strict (ASCII alphanumeric plus `-`
//!   and `_`) since snapshots are never navigational paths.
//! - **Branch names** follow a VCS ref-name style grammar: Unicode letters
//!   and digits plus a configurable punctuation set (default `-`, `_`, `/`),
//!   with fixed structural rules - no leading `/` or `.`, no trailing `/`,
//!   no `..` or `//`, no trailing `.lock`.

use crate::error::{PgBranchError, Result};
use std::path::{Path, PathBuf};

/// Separator between a dataset path and a snapshot name
pub const SNAPSHOT_SEPARATOR: char = '@';

/// Validate a bare snapshot name
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PgBranchError::invalid_name(name, "name is empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
    {
        return Err(PgBranchError::invalid_name(
            name,
            format!("character '{}' is not allowed in snapshot names", c),
        ));
    }
    Ok(())
}

/// Validate a branch name against the ref-name grammar
///
/// `symbols` is the configured punctuation set permitted besides Unicode
/// letters and digits.
pub fn validate_branch_name(name: &str, symbols: &[char]) -> Result<()> {
    if name.is_empty() {
        return Err(PgBranchError::invalid_name(name, "name is empty"));
    }
    if name.starts_with('/') || name.starts_with('.') {
        return Err(PgBranchError::invalid_name(name, "name may not start with '/' or '.'"));
    }
    if name.ends_with('/') {
        return Err(PgBranchError::invalid_name(name, "name may not end with '/'"));
    }
    if name.contains("//") {
        return Err(PgBranchError::invalid_name(name, "name may not contain '//'"));
    }
    if name.contains("..") {
        return Err(PgBranchError::invalid_name(name, "name may not contain '..'"));
    }
    if name.ends_with(".lock") {
        return Err(PgBranchError::invalid_name(name, "name may not end with '.lock'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_alphanumeric() && *c != '.' && !symbols.contains(c))
    {
        return Err(PgBranchError::invalid_name(
            name,
            format!("character '{}' is not allowed in branch names", c),
        ));
    }
    Ok(())
}

/// Resolve a snapshot name to its full backend path
///
/// A name containing the `@` separator is treated as already qualified and
/// returned as-is. A bare name is qualified against the primary data subtree:
/// `pool/data_subdir@name`. Bare names containing `/` are malformed - a path
/// separator only makes sense in an already-qualified name.
pub fn snapshot_path(pool: &str, data_subdir: &str, name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(PgBranchError::invalid_name(name, "name is empty"));
    }
    if name.contains(SNAPSHOT_SEPARATOR) {
        return Ok(name.to_string());
    }
    if name.contains('/') {
        return Err(PgBranchError::invalid_name(
            name,
            "bare snapshot names may not contain '/'",
        ));
    }
    validate_snapshot_name(name)?;
    Ok(format!("{}/{}{}{}", pool, data_subdir, SNAPSHOT_SEPARATOR, name))
}

/// Full backend path of a branch dataset, e.g. `dbpool/branches/feature`
pub fn branch_path(pool: &str, branches_subdir: &str, name: &str) -> String {
    format!("{}/{}/{}", pool, branches_subdir, name)
}

/// Host filesystem mount path for a dataset
///
/// Strips the pool prefix from the dataset path and joins the remainder under
/// the mount root: `mount_path("/mnt", "dbpool", "dbpool/branches/x")` is
/// `/mnt/branches/x`. The pool root itself maps to the mount root.
pub fn mount_path(mount_root: &Path, pool: &str, dataset: &str) -> PathBuf {
    let relative = dataset
        .strip_prefix(pool)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(dataset);
    if relative.is_empty() {
        mount_root.to_path_buf()
    } else {
        mount_root.join(relative)
    }
}

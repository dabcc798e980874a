//! Property-based testing for pgbranch
//!
//! Uses proptest to verify the name grammars and path mapping across
//! randomly generated inputs.

use ::pgbranch::naming;
use proptest::prelude::*;
use std::path::Path;

const SYMBOLS: &[char] = &['-', '_', '/'];

/// Names the branch grammar is expected to accept
fn valid_branch_name() -> impl Strategy<Value = String> {
    // leading alphanumeric segment, optional nested segments
    "[a-z][a-z0-9_-]{0,12}(/[a-z0-9][a-z0-9_-]{0,8}){0,3}"
}

/// Names the snapshot grammar is expected to accept
fn valid_snapshot_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9_-]{0,20}"
}

proptest! {
    #[test]
    fn valid_branch_names_are_accepted(name in valid_branch_name()) {
        prop_assert!(naming::validate_branch_name(&name, SYMBOLS).is_ok());
    }

    #[test]
    fn accepted_branch_names_round_trip_through_paths(name in valid_branch_name()) {
        let dataset = naming::branch_path("dbpool", "branches", &name);
        let expected = format!("dbpool/branches/{}", name);
        prop_assert_eq!(dataset.as_str(), expected.as_str());

        let mount = naming::mount_path(Path::new("/var/lib/pgbranch"), "dbpool", &dataset);
        prop_assert!(mount.starts_with("/var/lib/pgbranch/branches"));
        prop_assert!(mount.ends_with(Path::new(&name)));
    }

    #[test]
    fn validators_never_panic(name in ".*") {
        // any input must produce a verdict, not a crash
        let _ = naming::validate_branch_name(&name, SYMBOLS);
        let _ = naming::validate_snapshot_name(&name);
        let _ = naming::snapshot_path("dbpool", "data", &name);
    }

    #[test]
    fn valid_snapshot_names_qualify_against_primary(name in valid_snapshot_name()) {
        prop_assert!(naming::validate_snapshot_name(&name).is_ok());
        let path = naming::snapshot_path("dbpool", "data", &name).unwrap();
        let expected = format!("dbpool/data@{}", name);
        prop_assert_eq!(path.as_str(), expected.as_str());
    }

    #[test]
    fn snapshot_names_with_separators_are_rejected_or_qualified(name in "[a-z]{1,8}", branch in "[a-z]{1,8}") {
        // a qualified name passes through untouched
        let qualified = format!("dbpool/branches/{}@{}", branch, name);
        let qualified_path = naming::snapshot_path("dbpool", "data", &qualified).unwrap();
        prop_assert_eq!(
            qualified_path.as_str(),
            qualified.as_str()
        );
        // a bare name with a path separator is malformed
        let malformed = format!("{}/{}", branch, name);
        prop_assert!(naming::snapshot_path("dbpool", "data", &malformed).is_err());
    }

    #[test]
    fn structural_violations_are_rejected(name in "[a-z]{1,8}") {
        let leading_slash = format!("/{}", name);
        prop_assert!(naming::validate_branch_name(&leading_slash, SYMBOLS).is_err());
        let leading_dot = format!(".{}", name);
        prop_assert!(naming::validate_branch_name(&leading_dot, SYMBOLS).is_err());
        let trailing_slash = format!("{}/", name);
        prop_assert!(naming::validate_branch_name(&trailing_slash, SYMBOLS).is_err());
        let double_slash = format!("{}//{}", name, name);
        prop_assert!(naming::validate_branch_name(&double_slash, SYMBOLS).is_err());
        let double_dot = format!("{}..{}", name, name);
        prop_assert!(naming::validate_branch_name(&double_dot, SYMBOLS).is_err());
        let lock_suffix = format!("{}.lock", name);
        prop_assert!(naming::validate_branch_name(&lock_suffix, SYMBOLS).is_err());
    }
}

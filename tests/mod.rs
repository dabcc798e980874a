//! Main test module for pgbranch
//!
//! This module includes all test suites:
//! - Integration tests for multi-step lifecycle scenarios
//! - Property-based tests for the name grammars and path mapping

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::pgbranch::*;
    use std::sync::Arc;

    fn stack() -> (SnapshotManager, BranchManager, Arc<MemoryBackend>) {
        let config = Config {
            start_poll_attempts: 2,
            start_poll_interval_ms: 0,
            ..Config::default()
        };
        let backend = Arc::new(MemoryBackend::seeded(&config));
        let runtime = FakeRuntime::new();
        let snapshots = SnapshotManager::new(config.clone(), backend.clone());
        let branches = BranchManager::new(
            config,
            backend.clone(),
            runtime.probe(),
            Arc::new(runtime),
        );
        (snapshots, branches, backend)
    }

    #[test]
    fn test_delete_already_deleted_branch_is_not_found() {
        let (snapshots, branches, _) = stack();
        snapshots.create("base", None).unwrap();
        branches.create("feature", None, None, None).unwrap();
        branches.delete("feature", false).unwrap();

        // a second delete racing the first is arbitrated by the backend;
        // the loser sees NotFound, never a masked success
        assert!(matches!(
            branches.delete("feature", false),
            Err(PgBranchError::NotFound(_))
        ));
    }

    #[test]
    fn test_info_on_missing_nodes() {
        let (snapshots, branches, _) = stack();
        assert!(matches!(
            snapshots.info("ghost"),
            Err(PgBranchError::NotFound(_))
        ));
        assert!(matches!(
            branches.info("ghost"),
            Err(PgBranchError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_system_lists_are_empty() {
        let (snapshots, branches, _) = stack();
        assert!(snapshots.list().unwrap().is_empty());
        assert!(branches.list().unwrap().is_empty());
    }

    #[test]
    fn test_stop_missing_branch_is_not_found() {
        let (_, branches, _) = stack();
        assert!(matches!(
            branches.stop_instance("ghost"),
            Err(PgBranchError::NotFound(_))
        ));
    }
}

//! Integration tests for pgbranch
//!
//! Multi-step lifecycle scenarios over the public API, wired against the
//! in-memory backend and fake runtime.

use ::pgbranch::*;
use std::sync::Arc;

struct Stack {
    config: Config,
    backend: Arc<MemoryBackend>,
    runtime: FakeRuntime,
    snapshots: SnapshotManager,
    branches: BranchManager,
}

fn stack_with(config: Config) -> Stack {
    let backend = Arc::new(MemoryBackend::seeded(&config));
    let runtime = FakeRuntime::new();
    let snapshots = SnapshotManager::new(config.clone(), backend.clone());
    let branches = BranchManager::new(
        config.clone(),
        backend.clone(),
        runtime.probe(),
        Arc::new(runtime.clone()),
    );
    Stack {
        config,
        backend,
        runtime,
        snapshots,
        branches,
    }
}

fn stack() -> Stack {
    stack_with(Config {
        start_poll_attempts: 3,
        start_poll_interval_ms: 0,
        ..Config::default()
    })
}

#[test]
fn test_custom_pool_layout() {
    let s = stack_with(Config {
        pool: "tank".to_string(),
        data_subdir: "pg".to_string(),
        branches_subdir: "forks".to_string(),
        start_poll_attempts: 3,
        start_poll_interval_ms: 0,
        ..Config::default()
    });

    s.snapshots.create("base", None).unwrap();
    let info = s.branches.create("feature", None, None, None).unwrap();
    assert_eq!(info.path, "tank/forks/feature");
    assert_eq!(info.origin, "tank/pg@base");
    assert!(s.backend.exists("tank/forks/feature").unwrap());
}

#[test]
fn test_nested_branch_names() {
    let s = stack();
    s.snapshots.create("base", None).unwrap();

    s.branches.create("team/alice/wip", None, None, None).unwrap();
    let info = s.branches.info("team/alice/wip").unwrap();
    assert_eq!(info.name, "team/alice/wip");
    assert_eq!(info.path, "dbpool/branches/team/alice/wip");

    // only the leaf is a branch; intermediates are plain containers
    let names: Vec<String> = s.branches.list().unwrap().into_iter().map(|b| b.name).collect();
    assert_eq!(names, vec!["team/alice/wip".to_string()]);

    s.branches.delete("team/alice/wip", false).unwrap();
    assert!(!s.backend.exists("dbpool/branches/team/alice/wip").unwrap());
}

#[test]
fn test_port_range_exhaustion_across_branches() {
    let s = stack_with(Config {
        port_range_start: 6000,
        port_range_end: 6001,
        start_poll_attempts: 3,
        start_poll_interval_ms: 0,
        ..Config::default()
    });
    s.snapshots.create("base", None).unwrap();

    s.branches.create("a", None, None, None).unwrap();
    s.branches.create("b", None, None, None).unwrap();
    let err = s.branches.create("c", None, None, None).unwrap_err();
    assert!(matches!(err, PgBranchError::NoPortsAvailable { .. }));
    // the failed creation left no dataset behind
    assert!(!s.backend.exists("dbpool/branches/c").unwrap());
}

#[test]
fn test_snapshot_force_delete_surfaces_backend_refusal() {
    let s = stack();
    s.snapshots.create("base", None).unwrap();
    s.branches.create("feature", None, None, None).unwrap();

    // the manager's dependency check is bypassed by force, but the store
    // still refuses and that refusal must reach the caller verbatim
    let err = s.snapshots.delete("base", true).unwrap_err();
    assert!(matches!(err, PgBranchError::Backend(_)));
    assert!(s.backend.exists("dbpool/data@base").unwrap());
}

#[test]
fn test_second_generation_branching() {
    let s = stack();
    s.snapshots.create("base", None).unwrap();
    s.branches.create("feature", None, None, None).unwrap();
    let snap = s
        .branches
        .snapshot_from("feature", "checkpoint", Some("handoff"))
        .unwrap();

    let v2 = s
        .branches
        .create("feature-v2", None, Some(&snap), Some("feature"))
        .unwrap();
    assert_eq!(v2.origin, "dbpool/branches/feature@checkpoint");

    // the first branch now has a dependent lineage: deleting it recursively
    // would orphan the clone, so the backend refuses even when forced
    let err = s.branches.delete("feature", true).unwrap_err();
    assert!(matches!(err, PgBranchError::Backend(_)));

    // tear down in dependency order
    s.branches.delete("feature-v2", false).unwrap();
    s.branches.delete("feature", false).unwrap();
    assert!(s.branches.list().unwrap().is_empty());
}

#[test]
fn test_instances_survive_listing_and_stop_cycles() {
    let s = stack();
    s.snapshots.create("base", None).unwrap();
    s.branches.create("a", None, None, None).unwrap();
    s.branches.create("b", None, None, None).unwrap();

    assert_eq!(s.runtime.running_ports().len(), 2);
    let running = s
        .branches
        .list()
        .unwrap()
        .into_iter()
        .filter(|b| b.status == InstanceStatus::Running)
        .count();
    assert_eq!(running, 2);

    s.branches.stop_instance("a").unwrap();
    assert_eq!(s.runtime.running_ports().len(), 1);

    // the freed port is reusable by a new branch
    let c = s.branches.create("c", None, None, None).unwrap();
    assert!(c.port.is_some());

    s.branches.start_instance("a", None).unwrap();
    assert_eq!(s.runtime.running_ports().len(), 3);
}

#[test]
fn test_status_report_round_trips_through_json() {
    let s = stack();
    s.backend.set_attribute("dbpool", "health", "ONLINE").unwrap();
    s.runtime.occupy_port(s.config.primary_port);
    s.snapshots.create("base", Some("golden")).unwrap();
    s.branches.create("feature", None, None, None).unwrap();

    let aggregator = StatusAggregator::new(
        s.config.clone(),
        s.backend.clone(),
        s.runtime.probe(),
        Arc::new(s.runtime.clone()),
    );
    let report = aggregator.report().unwrap();
    assert!(report.healthy);

    // the report is the CLI's JSON payload; it must serialize cleanly
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["pool"]["health"], "ONLINE");
    assert_eq!(json["branches"][0]["status"], "running");
    assert_eq!(json["snapshots"][0]["message"], "golden");
}

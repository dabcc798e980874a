//! Database instance lifecycle
//!
//! An instance is the runtime process or container bound to exactly one
//! branch's mount and one port. It is never persisted as its own entity; its
//! existence is inferred by probing. This module provides:
//!
//! - [`InstanceRuntime`] - the narrow interface the core drives, with a
//!   subprocess implementation ([`PostgresRuntime`], via `pg_ctl`) and a
//!   managed-container implementation ([`DockerRuntime`])
//! - [`InstanceManager`] - the bounded readiness probe after start and the
//!   graceful-then-immediate stop escalation
//! - [`FakeRuntime`] - an in-memory runtime (with a matching port probe) so
//!   the lifecycle state machine can be exercised in tests without Postgres
//!   or Docker
//!
//! Startup that exceeds the retry ceiling is a [`StartupTimeout`] and the
//! partially started instance is cleaned up best-effort before the error
//! propagates.
//!
//! [`StartupTimeout`]: crate::error::PgBranchError::StartupTimeout

use crate::config::Config;
use crate::error::{PgBranchError, Result};
use crate::ports::PortProbe;
use crate::types::{InstanceStatus, StopMode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Runtime capability launching and supervising database instances
pub trait InstanceRuntime: Send + Sync {
    /// Launch an instance over `mount`, listening on `port`
    ///
    /// Returns the instance identifier. Launch is asynchronous: the caller
    /// polls [`InstanceRuntime::is_live`] to await readiness.
    fn start(&self, mount: &Path, port: u16) -> Result<String>;

    /// Shut an instance down in the requested mode
    fn stop(&self, id: &str, mount: &Path, mode: StopMode) -> Result<()>;

    /// True when the instance answers on its port
    fn is_live(&self, id: &str, port: u16) -> bool;

    /// Runtime version string for status reporting
    fn version(&self) -> Result<String>;
}

fn run(mut cmd: Command) -> Result<String> {
    trace!("exec {:?}", cmd);
    let output = cmd.output().map_err(|e| {
        PgBranchError::runtime(format!("failed to execute {:?}: {}", cmd.get_program(), e))
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(PgBranchError::Runtime(stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Turn a mount path into an identifier safe for container/process names
fn mangle_mount(mount: &Path) -> String {
    mount
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

// ---------------------------------------------------------------------------
// pg_ctl subprocess runtime
// ---------------------------------------------------------------------------

/// Runs instances as local `postgres` subprocesses via `pg_ctl`
#[derive(Debug, Clone)]
pub struct PostgresRuntime {
    bin_dir: PathBuf,
}

impl PostgresRuntime {
    /// Create a runtime using the configured Postgres binary directory
    pub fn new(config: &Config) -> Self {
        Self {
            bin_dir: config.pg_bin_dir.clone(),
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }
}

impl InstanceRuntime for PostgresRuntime {
    fn start(&self, mount: &Path, port: u16) -> Result<String> {
        let mut cmd = Command::new(self.tool("pg_ctl"));
        cmd.arg("-D")
            .arg(mount)
            .arg("-l")
            .arg(mount.join("pgbranch.log"))
            .arg("-o")
            .arg(format!("-p {} -h 127.0.0.1 -k /tmp", port))
            .arg("start");
        run(cmd)?;
        // the data directory doubles as the instance identifier for the
        // process runtime
        Ok(mount.display().to_string())
    }

    fn stop(&self, _id: &str, mount: &Path, mode: StopMode) -> Result<()> {
        let shutdown_mode = match mode {
            StopMode::Graceful => "fast",
            StopMode::Immediate => "immediate",
        };
        let mut cmd = Command::new(self.tool("pg_ctl"));
        cmd.arg("-D").arg(mount).arg("-m").arg(shutdown_mode).arg("stop");
        run(cmd)?;
        Ok(())
    }

    fn is_live(&self, _id: &str, port: u16) -> bool {
        let mut cmd = Command::new(self.tool("pg_isready"));
        cmd.arg("-q").arg("-h").arg("127.0.0.1").arg("-p").arg(port.to_string());
        run(cmd).is_ok()
    }

    fn version(&self) -> Result<String> {
        let mut cmd = Command::new(self.tool("postgres"));
        cmd.arg("--version");
        Ok(run(cmd)?.trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// docker container runtime
// ---------------------------------------------------------------------------

/// Runs instances as managed containers
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    image: String,
}

impl DockerRuntime {
    /// Create a runtime launching the configured image
    pub fn new(config: &Config) -> Self {
        Self {
            image: config.image.clone(),
        }
    }

    fn container_name(mount: &Path) -> String {
        format!("pgbranch-{}", mangle_mount(mount))
    }

    fn resolve_id(id: &str, mount: &Path) -> String {
        if id.is_empty() {
            Self::container_name(mount)
        } else {
            id.to_string()
        }
    }
}

impl InstanceRuntime for DockerRuntime {
    fn start(&self, mount: &Path, port: u16) -> Result<String> {
        let name = Self::container_name(mount);
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&name)
            .arg("-e")
            .arg("POSTGRES_HOST_AUTH_METHOD=trust")
            .arg("-v")
            .arg(format!("{}:/var/lib/postgresql/data", mount.display()))
            .arg("-p")
            .arg(format!("127.0.0.1:{}:5432", port))
            .arg(&self.image);
        run(cmd)?;
        // the derived name, not the hash docker prints, is the stable
        // identifier across invocations
        Ok(name)
    }

    fn stop(&self, id: &str, mount: &Path, mode: StopMode) -> Result<()> {
        let name = Self::resolve_id(id, mount);
        match mode {
            StopMode::Graceful => {
                let mut stop = Command::new("docker");
                stop.arg("stop").arg(&name);
                run(stop)?;
                let mut rm = Command::new("docker");
                rm.arg("rm").arg(&name);
                if let Err(e) = run(rm) {
                    warn!("failed to remove stopped container {}: {}", name, e);
                }
                Ok(())
            }
            StopMode::Immediate => {
                let mut rm = Command::new("docker");
                rm.arg("rm").arg("-f").arg(&name);
                run(rm)?;
                Ok(())
            }
        }
    }

    fn is_live(&self, id: &str, _port: u16) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut cmd = Command::new("docker");
        cmd.arg("inspect").arg("-f").arg("{{.State.Running}}").arg(id);
        matches!(run(cmd), Ok(out) if out.trim() == "true")
    }

    fn version(&self) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("--version");
        Ok(run(cmd)?.trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// lifecycle manager
// ---------------------------------------------------------------------------

/// Drives instance startup readiness and shutdown escalation
pub struct InstanceManager {
    runtime: Arc<dyn InstanceRuntime>,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl InstanceManager {
    /// Create a manager over the selected runtime
    pub fn new(config: &Config, runtime: Arc<dyn InstanceRuntime>) -> Self {
        Self {
            runtime,
            poll_attempts: config.start_poll_attempts,
            poll_interval: Duration::from_millis(config.start_poll_interval_ms),
        }
    }

    /// Start an instance and wait for it to become ready
    ///
    /// Polls the liveness probe at the configured interval up to the retry
    /// ceiling. On timeout the partially started instance is stopped
    /// best-effort and [`PgBranchError::StartupTimeout`] is returned.
    pub fn start(&self, mount: &Path, port: u16) -> Result<String> {
        info!("starting instance on port {} over {}", port, mount.display());
        let id = self.runtime.start(mount, port)?;
        for attempt in 1..=self.poll_attempts {
            if self.runtime.is_live(&id, port) {
                debug!("instance {} ready after {} probe(s)", id, attempt);
                return Ok(id);
            }
            trace!("instance {} not ready (attempt {}/{})", id, attempt, self.poll_attempts);
            std::thread::sleep(self.poll_interval);
        }
        let seconds = self.poll_attempts as u64 * self.poll_interval.as_millis() as u64 / 1000;
        warn!("instance {} never became ready, cleaning up", id);
        if let Err(e) = self.stop(&id, mount) {
            warn!("cleanup of timed-out instance {} failed: {}", id, e);
        }
        Err(PgBranchError::StartupTimeout { seconds })
    }

    /// Stop an instance, escalating from graceful to immediate
    pub fn stop(&self, id: &str, mount: &Path) -> Result<()> {
        match self.runtime.stop(id, mount, StopMode::Graceful) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("graceful stop of {} failed ({}), escalating to immediate", id, e);
                self.runtime.stop(id, mount, StopMode::Immediate)
            }
        }
    }

    /// Probe an instance's state
    pub fn status(&self, id: &str, port: u16) -> InstanceStatus {
        if self.runtime.is_live(id, port) {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        }
    }
}

// ---------------------------------------------------------------------------
// fake runtime for tests
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    /// id -> (port, answers liveness probes)
    running: Mutex<HashMap<String, (u16, bool)>>,
    /// ports busy for reasons outside this runtime (simulated foreign listeners)
    external_busy: Mutex<Vec<u16>>,
    /// remaining start calls to fail with a bind error
    fail_starts: Mutex<u32>,
    /// started instances never answer the liveness probe
    never_ready: AtomicBool,
    /// graceful stops fail, immediate succeeds
    fail_graceful: AtomicBool,
    /// every stop fails
    fail_all_stops: AtomicBool,
    /// record of stop modes requested, in order
    stop_modes: Mutex<Vec<StopMode>>,
}

/// In-memory instance runtime for exercising the lifecycle state machine
///
/// Pairs with [`FakeRuntime::probe`] so the port allocator and the runtime
/// share one view of which ports are busy.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<FakeState>,
}

impl FakeRuntime {
    /// Create a runtime with nothing running
    pub fn new() -> Self {
        Self::default()
    }

    /// A port probe that sees this runtime's instances as listeners
    pub fn probe(&self) -> Arc<dyn PortProbe> {
        Arc::new(FakePortProbe {
            state: Arc::clone(&self.state),
        })
    }

    /// Mark a port busy as if some unrelated process were listening
    pub fn occupy_port(&self, port: u16) {
        self.state.external_busy.lock().push(port);
    }

    /// Fail the next `n` start calls with a bind error
    pub fn fail_next_starts(&self, n: u32) {
        *self.state.fail_starts.lock() = n;
    }

    /// Started instances never become ready (forces the startup timeout)
    pub fn set_never_ready(&self, value: bool) {
        self.state.never_ready.store(value, Ordering::SeqCst);
    }

    /// Graceful stops fail; immediate stops still succeed
    pub fn set_fail_graceful_stop(&self, value: bool) {
        self.state.fail_graceful.store(value, Ordering::SeqCst);
    }

    /// Every stop call fails
    pub fn set_fail_all_stops(&self, value: bool) {
        self.state.fail_all_stops.store(value, Ordering::SeqCst);
    }

    /// Stop modes requested so far, in order
    pub fn stop_modes(&self) -> Vec<StopMode> {
        self.state.stop_modes.lock().clone()
    }

    /// Ports of currently running (ready) instances
    pub fn running_ports(&self) -> Vec<u16> {
        self.state
            .running
            .lock()
            .values()
            .filter(|(_, live)| *live)
            .map(|(port, _)| *port)
            .collect()
    }
}

impl InstanceRuntime for FakeRuntime {
    fn start(&self, mount: &Path, port: u16) -> Result<String> {
        {
            let mut fails = self.state.fail_starts.lock();
            if *fails > 0 {
                *fails -= 1;
                return Err(PgBranchError::runtime("bind: address already in use"));
            }
        }
        let busy = self.state.external_busy.lock().contains(&port)
            || self
                .state
                .running
                .lock()
                .values()
                .any(|(p, live)| *live && *p == port);
        if busy {
            return Err(PgBranchError::runtime("bind: address already in use"));
        }
        let id = format!("fake-{}", mangle_mount(mount));
        let live = !self.state.never_ready.load(Ordering::SeqCst);
        self.state.running.lock().insert(id.clone(), (port, live));
        Ok(id)
    }

    fn stop(&self, id: &str, mount: &Path, mode: StopMode) -> Result<()> {
        self.state.stop_modes.lock().push(mode);
        if self.state.fail_all_stops.load(Ordering::SeqCst) {
            return Err(PgBranchError::runtime("stop failed"));
        }
        if mode == StopMode::Graceful && self.state.fail_graceful.load(Ordering::SeqCst) {
            return Err(PgBranchError::runtime("graceful stop failed"));
        }
        let key = if id.is_empty() {
            format!("fake-{}", mangle_mount(mount))
        } else {
            id.to_string()
        };
        self.state.running.lock().remove(&key);
        Ok(())
    }

    fn is_live(&self, id: &str, port: u16) -> bool {
        self.state
            .running
            .lock()
            .get(id)
            .map(|(p, live)| *live && *p == port)
            .unwrap_or(false)
    }

    fn version(&self) -> Result<String> {
        Ok("fake-runtime 1.0".to_string())
    }
}

/// Port probe backed by a [`FakeRuntime`]'s state
pub struct FakePortProbe {
    state: Arc<FakeState>,
}

impl PortProbe for FakePortProbe {
    fn is_free(&self, port: u16) -> bool {
        if self.state.external_busy.lock().contains(&port) {
            return false;
        }
        !self
            .state
            .running
            .lock()
            .values()
            .any(|(p, live)| *live && *p == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> Config {
        Config {
            start_poll_attempts: 3,
            start_poll_interval_ms: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_start_becomes_ready() {
        let runtime = FakeRuntime::new();
        let manager = InstanceManager::new(&fast_config(), Arc::new(runtime.clone()));

        let id = manager.start(Path::new("/mnt/branches/x"), 6001).unwrap();
        assert!(runtime.running_ports().contains(&6001));
        assert_eq!(manager.status(&id, 6001), InstanceStatus::Running);
    }

    #[test]
    fn test_startup_timeout_cleans_up() {
        let runtime = FakeRuntime::new();
        runtime.set_never_ready(true);
        let manager = InstanceManager::new(&fast_config(), Arc::new(runtime.clone()));

        let err = manager.start(Path::new("/mnt/branches/x"), 6001).unwrap_err();
        assert!(matches!(err, PgBranchError::StartupTimeout { .. }));
        // the half-started instance was stopped during cleanup
        assert!(runtime.running_ports().is_empty());
        assert!(!runtime.stop_modes().is_empty());
    }

    #[test]
    fn test_stop_escalates_to_immediate() {
        let runtime = FakeRuntime::new();
        let manager = InstanceManager::new(&fast_config(), Arc::new(runtime.clone()));
        let id = manager.start(Path::new("/mnt/branches/x"), 6001).unwrap();

        runtime.set_fail_graceful_stop(true);
        manager.stop(&id, Path::new("/mnt/branches/x")).unwrap();
        assert_eq!(runtime.stop_modes(), vec![StopMode::Graceful, StopMode::Immediate]);
        assert!(runtime.running_ports().is_empty());
    }

    #[test]
    fn test_stop_failure_propagates_when_both_modes_fail() {
        let runtime = FakeRuntime::new();
        let manager = InstanceManager::new(&fast_config(), Arc::new(runtime.clone()));
        let id = manager.start(Path::new("/mnt/branches/x"), 6001).unwrap();

        runtime.set_fail_all_stops(true);
        assert!(manager.stop(&id, Path::new("/mnt/branches/x")).is_err());
    }

    #[test]
    fn test_probe_reflects_runtime_state() {
        let runtime = FakeRuntime::new();
        let probe = runtime.probe();
        assert!(probe.is_free(6001));

        let manager = InstanceManager::new(&fast_config(), Arc::new(runtime.clone()));
        manager.start(Path::new("/mnt/branches/x"), 6001).unwrap();
        assert!(!probe.is_free(6001));

        runtime.occupy_port(6002);
        assert!(!probe.is_free(6002));
    }

    #[test]
    fn test_mangle_mount() {
        assert_eq!(
            mangle_mount(Path::new("/var/lib/pgbranch/branches/feature/login")),
            "var-lib-pgbranch-branches-feature-login"
        );
    }
}

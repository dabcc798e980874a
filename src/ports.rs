//! Port allocation for branch instances
//!
//! Ports are the one shared mutable resource in the system, and the tool is a
//! short-lived process re-invoked per command - so the authority on whether a
//! port is taken is always a live probe, never a stored registry. The
//! [`PortAllocator`] combines the probe with an in-process reservation set so
//! that two allocations in the same invocation cannot hand out the same port.
//!
//! A race window between probe and bind remains across separate invocations;
//! callers treat a bind failure as a retryable allocation failure and re-run
//! allocation once (see [`crate::error::PgBranchError::is_port_conflict`]).

use crate::config::Config;
use crate::error::{PgBranchError, Result};
use dashmap::DashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Arc;
use tracing::{debug, trace};

/// Liveness probe for a single port
pub trait PortProbe: Send + Sync {
    /// True when nothing is listening on the port
    fn is_free(&self, port: u16) -> bool;
}

/// Probe that bind-tests `127.0.0.1:port`
///
/// Binding (rather than connecting) distinguishes "nothing listening" from
/// "listening but refusing us", which is what allocation cares about.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// Finds free ports within the configured range
pub struct PortAllocator {
    lo: u16,
    hi: u16,
    probe: Arc<dyn PortProbe>,
    reserved: DashSet<u16>,
}

impl PortAllocator {
    /// Create an allocator over the configured range
    pub fn new(config: &Config, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            lo: config.port_range_start,
            hi: config.port_range_end,
            probe,
            reserved: DashSet::new(),
        }
    }

    /// Allocate a port, honoring a preference when given
    ///
    /// A preferred port must lie within the range and probe free. Without a
    /// preference the range is scanned in ascending order and the first free,
    /// unreserved port wins; allocation without interference is idempotent up
    /// to the reservation this call records.
    pub fn allocate(&self, preferred: Option<u16>) -> Result<u16> {
        match preferred {
            Some(port) => {
                if port < self.lo || port > self.hi {
                    return Err(PgBranchError::PortOutOfRange {
                        port,
                        lo: self.lo,
                        hi: self.hi,
                    });
                }
                if self.reserved.contains(&port) || !self.probe.is_free(port) {
                    return Err(PgBranchError::PortUnavailable(port));
                }
                self.reserved.insert(port);
                debug!("allocated requested port {}", port);
                Ok(port)
            }
            None => {
                for port in self.lo..=self.hi {
                    if self.reserved.contains(&port) {
                        trace!("port {} reserved in-process, skipping", port);
                        continue;
                    }
                    if self.probe.is_free(port) {
                        self.reserved.insert(port);
                        debug!("allocated port {}", port);
                        return Ok(port);
                    }
                }
                Err(PgBranchError::NoPortsAvailable {
                    lo: self.lo,
                    hi: self.hi,
                })
            }
        }
    }

    /// Release an in-process reservation
    ///
    /// Used when a later step fails before anything bound the port, so the
    /// same invocation can hand it out again.
    pub fn release(&self, port: u16) {
        self.reserved.remove(&port);
    }

    /// Probe a port directly, ignoring in-process reservations
    ///
    /// This is the authoritative liveness check status reporting uses: a
    /// reservation made by this invocation says nothing about whether an
    /// instance actually answers.
    pub fn port_is_live(&self, port: u16) -> bool {
        !self.probe.is_free(port)
    }
}

//! Balancer configuration
//!
//! One `BalancerConfig` is loaded at startup and cloned into every worker
//! core. Reference sizing mirrors a single-NUMA deployment; all ceilings
//! are hard limits enforced by the tables, not hints.

use serde::{Deserialize, Serialize};

use crate::tuple::Tuple2;

/// A contiguous range of local SNAT endpoints on one address.
///
/// The balancer substitutes tuples drawn from these ranges for the client
/// source address so return traffic routes back through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRange {
    /// Local IPv4 address owned by the balancer (host byte order)
    pub ip: u32,
    /// First usable port
    pub port_lo: u16,
    /// Last usable port (inclusive)
    pub port_hi: u16,
}

impl LocalRange {
    /// Number of tuples this range yields
    pub fn len(&self) -> usize {
        (self.port_hi as usize).saturating_sub(self.port_lo as usize) + 1
    }

    /// True if the range yields no tuples
    pub fn is_empty(&self) -> bool {
        self.port_hi < self.port_lo
    }

    /// Iterate the endpoints of this range
    pub fn tuples(&self) -> impl Iterator<Item = Tuple2> + '_ {
        (self.port_lo..=self.port_hi).map(|p| Tuple2::new(self.ip, p))
    }
}

/// Balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Number of worker cores (core 0 is the authoritative master)
    pub worker_cores: usize,
    /// Connection slots per core (slot 0 is reserved)
    pub max_connections: usize,
    /// Virtual services ceiling, table-wide
    pub max_virtual_services: usize,
    /// Real services ceiling, table-wide
    pub max_real_services: usize,
    /// Attached real services ceiling per virtual service
    pub max_reals_per_virtual: usize,
    /// Local SNAT ranges carved up between cores
    pub local_ranges: Vec<LocalRange>,
    /// SNAT tuples handed to each real service on creation
    pub snat_pool_per_real: usize,
    /// Timer-wheel tick length in milliseconds
    pub tick_interval_ms: u64,
    /// Metrics commit period, in ticks
    pub metrics_commit_ticks: u64,
    /// Depth of each cross-core command ring
    pub command_ring_depth: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            worker_cores: 4,
            max_connections: 1 << 20,
            max_virtual_services: 16384,
            max_real_services: 65536,
            max_reals_per_virtual: 256,
            local_ranges: Vec::new(),
            snat_pool_per_real: 256,
            tick_interval_ms: 100,
            metrics_commit_ticks: 10,
            command_ring_depth: 1024,
        }
    }
}

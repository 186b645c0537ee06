//! Service and core statistics
//!
//! Lock-free counter blocks, cache-line aligned. Per-service handles are
//! shared by `Arc` between the control plane and every core's private
//! service records; the hot path only does relaxed increments. A
//! `MetricsHub` owns the export registry and periodically commits deltas
//! into the `metrics` facade under names derived from the service
//! endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use riptide_common::Tuple2;

/// Per-service counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    /// Sessions that completed the three-way handshake
    pub connections: AtomicU64,
    /// Packets seen client -> service
    pub packets_in: AtomicU64,
    /// Bytes seen client -> service
    pub bytes_in: AtomicU64,
    /// Packets seen service -> client
    pub packets_out: AtomicU64,
    /// Bytes seen service -> client
    pub bytes_out: AtomicU64,
}

impl ServiceMetrics {
    /// One established session
    #[inline(always)]
    pub fn record_conn(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// One inbound packet
    #[inline(always)]
    pub fn record_in(&self, bytes: u64) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// One outbound packet
    #[inline(always)]
    pub fn record_out(&self, bytes: u64) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Non-atomic copy of the current values
    pub fn snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ServiceMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceMetricsSnapshot {
    /// Established sessions
    pub connections: u64,
    /// Packets client -> service
    pub packets_in: u64,
    /// Bytes client -> service
    pub bytes_in: u64,
    /// Packets service -> client
    pub packets_out: u64,
    /// Bytes service -> client
    pub bytes_out: u64,
}

/// Per-core data-path counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CoreStats {
    /// Frames received
    pub rx_packets: AtomicU64,
    /// Frames forwarded
    pub tx_packets: AtomicU64,
    /// Frames dropped
    pub dropped: AtomicU64,
    /// Resets synthesized for invalid transitions
    pub resets: AtomicU64,
    /// Connection-table hits
    pub conn_hits: AtomicU64,
    /// Connection-table misses
    pub conn_misses: AtomicU64,
    /// Connections created
    pub conn_creates: AtomicU64,
    /// Connections expired by the wheel
    pub conn_expires: AtomicU64,
    /// Commands applied from the cross-core ring
    pub commands_applied: AtomicU64,
}

impl CoreStats {
    /// Non-atomic copy of the current values
    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            conn_hits: self.conn_hits.load(Ordering::Relaxed),
            conn_misses: self.conn_misses.load(Ordering::Relaxed),
            conn_creates: self.conn_creates.load(Ordering::Relaxed),
            conn_expires: self.conn_expires.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`CoreStats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreStatsSnapshot {
    /// Frames received
    pub rx_packets: u64,
    /// Frames forwarded
    pub tx_packets: u64,
    /// Frames dropped
    pub dropped: u64,
    /// Resets synthesized
    pub resets: u64,
    /// Connection-table hits
    pub conn_hits: u64,
    /// Connection-table misses
    pub conn_misses: u64,
    /// Connections created
    pub conn_creates: u64,
    /// Connections expired
    pub conn_expires: u64,
    /// Commands applied
    pub commands_applied: u64,
}

struct HubEntry {
    name: String,
    handle: Arc<ServiceMetrics>,
    last: ServiceMetricsSnapshot,
}

/// Export registry for per-service counters.
///
/// Exposure and withdrawal happen on control-plane mutations only; the
/// write lock is never taken on the packet path.
#[derive(Default)]
pub struct MetricsHub {
    entries: RwLock<HashMap<Tuple2, HubEntry>>,
}

impl MetricsHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Start exporting `handle` under a name derived from `tuple`.
    /// Re-exposing an endpoint swaps in the new handle and restarts its
    /// delta baseline. Returns true when the endpoint was newly exposed
    /// (callers use this to schedule the commit timer exactly once).
    pub fn expose(&self, tuple: Tuple2, handle: Arc<ServiceMetrics>) -> bool {
        let mut entries = self.entries.write();
        entries
            .insert(
                tuple,
                HubEntry {
                    name: tuple.export_name(),
                    handle,
                    last: ServiceMetricsSnapshot::default(),
                },
            )
            .is_none()
    }

    /// Stop exporting an endpoint. Pending deltas are discarded.
    pub fn withdraw(&self, tuple: &Tuple2) {
        self.entries.write().remove(tuple);
    }

    /// True if the endpoint is currently exported
    pub fn is_exposed(&self, tuple: &Tuple2) -> bool {
        self.entries.read().contains_key(tuple)
    }

    /// Commit one service's counter deltas into the metrics facade.
    /// Returns false when the endpoint is no longer exported (callers use
    /// this to stop rescheduling the commit).
    pub fn commit(&self, tuple: &Tuple2) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(tuple) else {
            return false;
        };
        let snap = entry.handle.snapshot();
        let service = entry.name.clone();
        metrics::counter!("riptide_service_connections", "service" => service.clone())
            .increment(snap.connections - entry.last.connections);
        metrics::counter!("riptide_service_packets_in", "service" => service.clone())
            .increment(snap.packets_in - entry.last.packets_in);
        metrics::counter!("riptide_service_bytes_in", "service" => service.clone())
            .increment(snap.bytes_in - entry.last.bytes_in);
        metrics::counter!("riptide_service_packets_out", "service" => service.clone())
            .increment(snap.packets_out - entry.last.packets_out);
        metrics::counter!("riptide_service_bytes_out", "service" => service)
            .increment(snap.bytes_out - entry.last.bytes_out);
        entry.last = snap;
        true
    }
}

//! Connection table
//!
//! Maps both directions of a balanced TCP session onto one slot in a flat
//! connection array: (client -> VIP) and (real -> local SNAT) resolve to
//! the same record. Slot 0 is reserved as the absent sentinel, which also
//! arbitrates creation races from duplicate SYNs: the first emplace leaves
//! a zero-valued pending entry that is either completed or rolled back
//! before the call returns.

use std::sync::Arc;

use riptide_common::{Tuple2, Tuple4};

use crate::conntrack::{next_state, Dir, FlagClass, TcpState, Transition};
use crate::service::{RealRef, ServiceTable};
use crate::stats::ServiceMetrics;
use crate::table::FlowMap;
use crate::wheel::TimerToken;

/// One tracked TCP session
pub struct Connection {
    /// Client endpoint
    pub client: Tuple2,
    /// SNAT endpoint lent by the real service
    pub local: Tuple2,
    /// VIP the client connected to
    pub virtual_tuple: Tuple2,
    /// Counter block of the owning virtual service
    pub virtual_metrics: Arc<ServiceMetrics>,
    /// The backend serving this session
    pub real: RealRef,
    /// Tracked TCP state
    pub state: TcpState,
    /// Timeout currently scheduled in the owning core's wheel
    pub timer: Option<TimerToken>,
}

impl Connection {
    /// Backend endpoint
    pub fn real_tuple(&self) -> Tuple2 {
        self.real.borrow().tuple
    }

    /// Which direction a packet keyed by `key` travels
    #[inline(always)]
    pub fn direction_of(&self, key: &Tuple4) -> Dir {
        if key.dst == self.virtual_tuple {
            Dir::Original
        } else {
            Dir::Reply
        }
    }
}

/// Per-core connection table
pub struct ConnTable {
    index: FlowMap<Tuple4, u32>,
    slots: Vec<Option<Connection>>,
    free: Vec<u32>,
}

impl ConnTable {
    /// Create a table with `capacity` usable slots (slot 0 stays reserved)
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity + 1).map(|_| None).collect();
        // Two index entries per connection.
        let index = FlowMap::with_capacity((capacity + 1) * 2);
        let free = (1..=capacity as u32).rev().collect();
        Self { index, slots, free }
    }

    /// Live connections
    pub fn len(&self) -> usize {
        self.slots.len() - 1 - self.free.len()
    }

    /// True when no connections are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable slot capacity
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Look up a session by either of its flow keys
    #[inline]
    pub fn find(&self, key: &Tuple4) -> Option<u32> {
        self.index.find(key).copied().filter(|&s| s != 0)
    }

    /// Access a session by slot
    pub fn get(&self, slot: u32) -> Option<&Connection> {
        self.slots.get(slot as usize)?.as_ref()
    }

    /// Access a session by slot, mutably
    pub fn get_mut(&mut self, slot: u32) -> Option<&mut Connection> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    /// Create the session for (client -> VIP) unless it already exists.
    ///
    /// Returns the slot either way; `None` means the session cannot be
    /// created (index collision, table full, no backend selectable, or the
    /// backend's SNAT pool is empty) and any partial index entry has been
    /// rolled back. The new session starts in `SynSent`; scheduling its
    /// timeout is the caller's job.
    pub fn ensure_connection_exists(
        &mut self,
        services: &ServiceTable,
        virtual_tuple: Tuple2,
        client: Tuple2,
    ) -> Option<u32> {
        let vs = services.find_virtual_service(&virtual_tuple)?;
        let key_in = Tuple4::new(client, virtual_tuple);

        match self.index.emplace(key_in, 0) {
            None => return None,
            Some(&mut existing) if existing != 0 => return Some(existing),
            Some(_) => {}
        }

        // Pending entry placed; every failure leg below must undo it.
        if self.free.is_empty() {
            self.index.remove(&key_in);
            return None;
        }
        let Some(real) = services.select_real(vs, &client) else {
            self.index.remove(&key_in);
            return None;
        };
        let Some(local) = real.borrow_mut().take_local() else {
            self.index.remove(&key_in);
            return None;
        };
        let Some(slot) = self.free.pop() else {
            real.borrow_mut().release_local(local);
            self.index.remove(&key_in);
            return None;
        };

        let real_tuple = real.borrow().tuple;
        let key_out = Tuple4::new(real_tuple, local);
        // The client-direction key proved this session is brand new, so the
        // reply-direction key cannot exist either.
        if self.index.emplace_unique(key_out, slot).is_none() {
            self.free.push(slot);
            real.borrow_mut().release_local(local);
            self.index.remove(&key_in);
            return None;
        }

        if let Some(v) = self.index.find_mut(&key_in) {
            *v = slot;
        }
        self.slots[slot as usize] = Some(Connection {
            client,
            local,
            virtual_tuple,
            virtual_metrics: vs.metrics.clone(),
            real,
            state: TcpState::SynSent,
            timer: None,
        });
        Some(slot)
    }

    /// Step the session's state machine for one packet.
    ///
    /// A landing transition updates the state and, exactly on the
    /// SYN_RECV -> ESTABLISHED edge, bumps both services' connection
    /// counters. Timer rescheduling is left to the caller, which owns the
    /// wheel.
    pub fn transition(&mut self, slot: u32, dir: Dir, class: FlagClass) -> Transition {
        let Some(conn) = self.get_mut(slot) else {
            return Transition::Invalid;
        };
        let outcome = next_state(conn.state, dir, class);
        if let Transition::To(next) = outcome {
            if conn.state == TcpState::SynRecv && next == TcpState::Established {
                conn.virtual_metrics.record_conn();
                conn.real.borrow().metrics.record_conn();
            }
            conn.state = next;
        }
        outcome
    }

    /// Tear down a session: unlink both index keys, reclaim the SNAT
    /// endpoint and free the slot. Returns the backend tuple so the caller
    /// can let the registry destroy a fully detached real service.
    pub fn expire(&mut self, slot: u32) -> Option<Tuple2> {
        let conn = self.slots.get_mut(slot as usize)?.take()?;
        self.index
            .remove(&Tuple4::new(conn.client, conn.virtual_tuple));
        let real_tuple = conn.real.borrow().tuple;
        self.index.remove(&Tuple4::new(real_tuple, conn.local));
        conn.real.borrow_mut().release_local(conn.local);
        self.free.push(slot);
        Some(real_tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_common::{BalancerConfig, LocalRange};

    fn config() -> BalancerConfig {
        BalancerConfig {
            worker_cores: 1,
            max_connections: 8,
            local_ranges: vec![LocalRange {
                ip: 0x0a000003,
                port_lo: 10_000,
                port_hi: 10_015,
            }],
            snat_pool_per_real: 4,
            ..Default::default()
        }
    }

    fn setup() -> (ServiceTable, ConnTable, Tuple2, Tuple2) {
        let cfg = config();
        let mut services = ServiceTable::new(&cfg, 0);
        let vip = Tuple2::new(0x0a000001, 80);
        let backend = Tuple2::new(0x0a000002, 8080);
        services
            .ensure_virtual_service_exists(vip, Arc::new(ServiceMetrics::default()))
            .unwrap();
        services
            .ensure_real_service_exists(backend, Arc::new(ServiceMetrics::default()))
            .unwrap();
        services.ensure_attached(&vip, &backend).unwrap();
        let conns = ConnTable::new(cfg.max_connections);
        (services, conns, vip, backend)
    }

    #[test]
    fn test_create_and_find_both_directions() {
        let (services, mut conns, vip, backend) = setup();
        let client = Tuple2::new(0xc0a80105, 40_000);

        let slot = conns.ensure_connection_exists(&services, vip, client).unwrap();
        assert_ne!(slot, 0);
        let conn = conns.get(slot).unwrap();
        assert_eq!(conn.state, TcpState::SynSent);
        assert_eq!(conn.client, client);
        assert_eq!(conn.real_tuple(), backend);

        let local = conn.local;
        assert_eq!(conns.find(&Tuple4::new(client, vip)), Some(slot));
        assert_eq!(conns.find(&Tuple4::new(backend, local)), Some(slot));
    }

    #[test]
    fn test_duplicate_syn_is_idempotent() {
        let (services, mut conns, vip, _) = setup();
        let client = Tuple2::new(0xc0a80105, 40_000);

        let a = conns.ensure_connection_exists(&services, vip, client).unwrap();
        let b = conns.ensure_connection_exists(&services, vip, client).unwrap();
        assert_eq!(a, b);
        assert_eq!(conns.len(), 1);
    }

    #[test]
    fn test_no_virtual_service_no_connection() {
        let (services, mut conns, _, _) = setup();
        let client = Tuple2::new(0xc0a80105, 40_000);
        let other_vip = Tuple2::new(0x0a000009, 443);
        assert!(conns
            .ensure_connection_exists(&services, other_vip, client)
            .is_none());
        // Rollback means a retry against a real VIP still works.
        assert_eq!(conns.len(), 0);
    }

    #[test]
    fn test_no_backend_rolls_back_index() {
        let cfg = config();
        let mut services = ServiceTable::new(&cfg, 0);
        let vip = Tuple2::new(0x0a000001, 80);
        services
            .ensure_virtual_service_exists(vip, Arc::new(ServiceMetrics::default()))
            .unwrap();
        let mut conns = ConnTable::new(cfg.max_connections);
        let client = Tuple2::new(0xc0a80105, 40_000);

        assert!(conns.ensure_connection_exists(&services, vip, client).is_none());
        // The pending entry must not linger: the same tuple can be created
        // once a backend appears.
        services
            .ensure_real_service_exists(
                Tuple2::new(0x0a000002, 8080),
                Arc::new(ServiceMetrics::default()),
            )
            .unwrap();
        services
            .ensure_attached(&vip, &Tuple2::new(0x0a000002, 8080))
            .unwrap();
        assert!(conns.ensure_connection_exists(&services, vip, client).is_some());
    }

    #[test]
    fn test_snat_pool_exhaustion() {
        let (services, mut conns, vip, _) = setup();
        // Pool holds 4 tuples.
        for i in 0..4u16 {
            let client = Tuple2::new(0xc0a80105, 40_000 + i);
            assert!(conns.ensure_connection_exists(&services, vip, client).is_some());
        }
        let client = Tuple2::new(0xc0a80105, 50_000);
        assert!(conns.ensure_connection_exists(&services, vip, client).is_none());
        assert_eq!(conns.len(), 4);
    }

    #[test]
    fn test_table_full() {
        let cfg = BalancerConfig {
            max_connections: 2,
            ..config()
        };
        let mut services = ServiceTable::new(&cfg, 0);
        let vip = Tuple2::new(0x0a000001, 80);
        let backend = Tuple2::new(0x0a000002, 8080);
        services
            .ensure_virtual_service_exists(vip, Arc::new(ServiceMetrics::default()))
            .unwrap();
        services
            .ensure_real_service_exists(backend, Arc::new(ServiceMetrics::default()))
            .unwrap();
        services.ensure_attached(&vip, &backend).unwrap();
        let mut conns = ConnTable::new(cfg.max_connections);

        for i in 0..2u16 {
            let client = Tuple2::new(0xc0a80105, 40_000 + i);
            assert!(conns.ensure_connection_exists(&services, vip, client).is_some());
        }
        let client = Tuple2::new(0xc0a80105, 50_000);
        assert!(conns.ensure_connection_exists(&services, vip, client).is_none());
    }

    #[test]
    fn test_expire_returns_resources() {
        let (mut services, mut conns, vip, backend) = setup();
        let client = Tuple2::new(0xc0a80105, 40_000);
        let slot = conns.ensure_connection_exists(&services, vip, client).unwrap();
        let local = conns.get(slot).unwrap().local;
        let pool_before = {
            let vs = services.find_virtual_service(&vip).unwrap();
            vs.attached()[0].borrow().pool_free()
        };

        let real_tuple = conns.expire(slot).unwrap();
        assert_eq!(real_tuple, backend);
        services.maybe_destroy(&real_tuple);

        assert_eq!(conns.len(), 0);
        assert!(conns.find(&Tuple4::new(client, vip)).is_none());
        assert!(conns.find(&Tuple4::new(backend, local)).is_none());
        let vs = services.find_virtual_service(&vip).unwrap();
        assert_eq!(vs.attached()[0].borrow().pool_free(), pool_before + 1);

        // The slot is reusable.
        assert!(conns.ensure_connection_exists(&services, vip, client).is_some());
    }

    #[test]
    fn test_handshake_counts_once() {
        let (services, mut conns, vip, _) = setup();
        let client = Tuple2::new(0xc0a80105, 40_000);
        let slot = conns.ensure_connection_exists(&services, vip, client).unwrap();

        let vs_metrics = services.find_virtual_service(&vip).unwrap().metrics.clone();

        assert_eq!(
            conns.transition(slot, Dir::Reply, FlagClass::SynAck),
            Transition::To(TcpState::SynRecv)
        );
        assert_eq!(
            conns.transition(slot, Dir::Original, FlagClass::Ack),
            Transition::To(TcpState::Established)
        );
        assert_eq!(vs_metrics.snapshot().connections, 1);

        // More traffic does not recount.
        assert_eq!(
            conns.transition(slot, Dir::Original, FlagClass::Ack),
            Transition::To(TcpState::Established)
        );
        assert_eq!(vs_metrics.snapshot().connections, 1);
    }

    #[test]
    fn test_invalid_transition_reported() {
        let (services, mut conns, vip, _) = setup();
        let client = Tuple2::new(0xc0a80105, 40_000);
        let slot = conns.ensure_connection_exists(&services, vip, client).unwrap();
        // A bare SYN-ACK in the original direction makes no sense here.
        assert_eq!(
            conns.transition(slot, Dir::Original, FlagClass::SynAck),
            Transition::Invalid
        );
        // State unchanged.
        assert_eq!(conns.get(slot).unwrap().state, TcpState::SynSent);
    }
}

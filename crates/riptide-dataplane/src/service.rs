//! Virtual / real service registry
//!
//! One `ServiceTable` per core, touched only by its owning thread. Virtual
//! services own an ordered list of attached real services; real services
//! are shared (`Rc`) between every attaching virtual service and every
//! in-flight connection, and are destroyed lazily once the last owner lets
//! go. Control-plane mutations arrive either directly (master core) or
//! replayed off the command ring (worker cores).

use std::cell::RefCell;
use std::hash::Hasher;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use riptide_common::{BalancerConfig, ServiceError, ServiceResult, Tuple2};

use crate::stats::ServiceMetrics;
use crate::table::{FlowMap, FnvHasher};

/// Shared handle to a real service
pub type RealRef = Rc<RefCell<RealService>>;

/// Core-local pool of SNAT endpoints.
///
/// Each core receives a disjoint stripe of the configured local ranges, so
/// tuples lent to real services are unique within the core and return traffic
/// hashed to this core always finds its connection here.
#[derive(Clone)]
pub struct SnatAllocator {
    free: Rc<RefCell<Vec<Tuple2>>>,
}

impl SnatAllocator {
    /// Build this core's stripe of the configured ranges
    pub fn for_core(config: &BalancerConfig, core_id: usize) -> Self {
        let stride = config.worker_cores.max(1);
        let free = config
            .local_ranges
            .iter()
            .flat_map(|r| r.tuples())
            .enumerate()
            .filter(|(i, _)| i % stride == core_id % stride)
            .map(|(_, t)| t)
            .collect();
        Self {
            free: Rc::new(RefCell::new(free)),
        }
    }

    /// Take up to `n` endpoints
    fn take(&self, n: usize) -> Vec<Tuple2> {
        let mut free = self.free.borrow_mut();
        let at = free.len().saturating_sub(n);
        free.split_off(at)
    }

    /// Return endpoints to the pool
    fn release(&self, tuples: impl IntoIterator<Item = Tuple2>) {
        self.free.borrow_mut().extend(tuples);
    }

    /// Endpoints currently unassigned
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }
}

/// Backend server record
pub struct RealService {
    /// Backend endpoint
    pub tuple: Tuple2,
    /// Shared counter block (swapped on resurrection)
    pub metrics: Arc<ServiceMetrics>,
    /// SNAT endpoints available for new connections
    pool: Vec<Tuple2>,
    /// Virtual services currently attaching this backend
    attached_to: Vec<Tuple2>,
    allocator: SnatAllocator,
}

impl RealService {
    /// Lend one SNAT endpoint to a new connection
    pub fn take_local(&mut self) -> Option<Tuple2> {
        self.pool.pop()
    }

    /// Reclaim a SNAT endpoint from an ended connection
    pub fn release_local(&mut self, tuple: Tuple2) {
        self.pool.push(tuple);
    }

    /// SNAT endpoints not currently lent out
    pub fn pool_free(&self) -> usize {
        self.pool.len()
    }

    /// Virtual services attaching this backend
    pub fn attached_to(&self) -> &[Tuple2] {
        &self.attached_to
    }
}

impl Drop for RealService {
    fn drop(&mut self) {
        // Connections reclaim their tuple before releasing the last
        // reference, so the full pool goes back to the core allocator.
        self.allocator.release(self.pool.drain(..));
    }
}

/// Client-facing service record
pub struct VirtualService {
    /// The VIP endpoint clients connect to
    pub tuple: Tuple2,
    /// Shared counter block
    pub metrics: Arc<ServiceMetrics>,
    /// Attached backends, in attach order
    attached: Vec<RealRef>,
}

impl VirtualService {
    /// Attached backends, in attach order
    pub fn attached(&self) -> &[RealRef] {
        &self.attached
    }
}

/// Pick a backend index for a new client.
///
/// The contract is a stable, deterministic mapping; implementations may
/// weight or health-check but the default does neither.
pub trait Selector: Send {
    /// Index into the attach list, `< count`
    fn select(&self, client: &Tuple2, count: usize) -> usize;
}

/// Unweighted modulo-hash over the client endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn select(&self, client: &Tuple2, count: usize) -> usize {
        let mut h = FnvHasher::default();
        h.write(&client.to_bytes());
        (h.finish() % count as u64) as usize
    }
}

/// Topology snapshot of one virtual service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualSnapshot {
    /// VIP endpoint
    pub tuple: Tuple2,
    /// Attached backend endpoints, in attach order
    pub attached: Vec<Tuple2>,
}

/// Topology snapshot of one real service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealSnapshot {
    /// Backend endpoint
    pub tuple: Tuple2,
    /// SNAT endpoints not lent out
    pub pool_free: usize,
}

/// Per-core registry of virtual and real services
pub struct ServiceTable {
    virtuals: FlowMap<Tuple2, VirtualService>,
    reals: FlowMap<Tuple2, RealRef>,
    max_virtual: usize,
    max_real: usize,
    max_reals_per_virtual: usize,
    snat_pool_per_real: usize,
    selector: Box<dyn Selector>,
    snat: SnatAllocator,
}

impl ServiceTable {
    /// Build this core's registry from the shared configuration
    pub fn new(config: &BalancerConfig, core_id: usize) -> Self {
        Self::with_selector(config, core_id, Box::new(HashSelector))
    }

    /// Build with a non-default selection policy
    pub fn with_selector(
        config: &BalancerConfig,
        core_id: usize,
        selector: Box<dyn Selector>,
    ) -> Self {
        Self {
            virtuals: FlowMap::with_capacity(config.max_virtual_services),
            reals: FlowMap::with_capacity(config.max_real_services),
            max_virtual: config.max_virtual_services,
            max_real: config.max_real_services,
            max_reals_per_virtual: config.max_reals_per_virtual,
            snat_pool_per_real: config.snat_pool_per_real,
            selector,
            snat: SnatAllocator::for_core(config, core_id),
        }
    }

    /// Look up a virtual service by its VIP
    pub fn find_virtual_service(&self, tuple: &Tuple2) -> Option<&VirtualService> {
        self.virtuals.find(tuple)
    }

    /// Virtual services currently registered
    pub fn virtual_count(&self) -> usize {
        self.virtuals.len()
    }

    /// Real services currently registered (including fully detached ones
    /// kept alive by in-flight connections)
    pub fn real_count(&self) -> usize {
        self.reals.len()
    }

    /// This core's SNAT allocator
    pub fn snat(&self) -> &SnatAllocator {
        &self.snat
    }

    /// Create the virtual service if absent. Re-calling with an existing
    /// VIP returns the existing record unchanged.
    pub fn ensure_virtual_service_exists(
        &mut self,
        tuple: Tuple2,
        metrics: Arc<ServiceMetrics>,
    ) -> ServiceResult<&mut VirtualService> {
        if self.virtuals.find(&tuple).is_none() && self.virtuals.len() >= self.max_virtual {
            return Err(ServiceError::MaxVirtualServices);
        }
        self.virtuals
            .emplace(
                tuple,
                VirtualService {
                    tuple,
                    metrics,
                    attached: Vec::new(),
                },
            )
            .ok_or(ServiceError::Collision)
    }

    /// Create the real service if absent.
    ///
    /// An existing record (even one mid-detachment, kept alive by
    /// connections) is resurrected: its metrics handle is replaced with the
    /// supplied one and its SNAT pool state is preserved.
    pub fn ensure_real_service_exists(
        &mut self,
        tuple: Tuple2,
        metrics: Arc<ServiceMetrics>,
    ) -> ServiceResult<RealRef> {
        if let Some(real) = self.reals.find(&tuple) {
            real.borrow_mut().metrics = metrics;
            return Ok(real.clone());
        }
        if self.reals.len() >= self.max_real {
            return Err(ServiceError::MaxRealServices);
        }
        let pool = self.snat.take(self.snat_pool_per_real);
        if pool.is_empty() {
            warn!(real = %tuple, "real service created with empty SNAT pool");
        }
        let real: RealRef = Rc::new(RefCell::new(RealService {
            tuple,
            metrics,
            pool,
            attached_to: Vec::new(),
            allocator: self.snat.clone(),
        }));
        // A collision drops the fresh record, returning its pool.
        self.reals
            .emplace(tuple, real.clone())
            .ok_or(ServiceError::Collision)?;
        Ok(real)
    }

    /// Attach a real service to a virtual service. No-op when already
    /// attached; both records must exist.
    pub fn ensure_attached(&mut self, vt: &Tuple2, rt: &Tuple2) -> ServiceResult<()> {
        let real = self
            .reals
            .find(rt)
            .cloned()
            .ok_or_else(|| ServiceError::RealServiceNotFound(rt.to_string()))?;
        let vs = self
            .virtuals
            .find_mut(vt)
            .ok_or_else(|| ServiceError::VirtualServiceNotFound(vt.to_string()))?;
        if vs.attached.iter().any(|r| r.borrow().tuple == *rt) {
            return Ok(());
        }
        if vs.attached.len() >= self.max_reals_per_virtual {
            return Err(ServiceError::MaxRealsPerVirtual);
        }
        vs.attached.push(real.clone());
        real.borrow_mut().attached_to.push(*vt);
        Ok(())
    }

    /// Detach a real service from a virtual service. No-op when not
    /// attached or when either record is absent.
    pub fn ensure_detached(&mut self, vt: &Tuple2, rt: &Tuple2) {
        if let Some(vs) = self.virtuals.find_mut(vt) {
            vs.attached.retain(|r| r.borrow().tuple != *rt);
        }
        if let Some(real) = self.reals.find(rt) {
            real.borrow_mut().attached_to.retain(|t| t != vt);
        }
        self.maybe_destroy(rt);
    }

    /// True iff no virtual service references this backend
    pub fn is_detached(&self, rt: &Tuple2) -> bool {
        match self.reals.find(rt) {
            Some(real) => real.borrow().attached_to.is_empty(),
            None => true,
        }
    }

    /// Remove a virtual service, detaching all its backends first. No-op
    /// when absent.
    pub fn remove_virtual_service(&mut self, vt: &Tuple2) {
        let Some(vs) = self.virtuals.remove(vt) else {
            return;
        };
        for real in vs.attached {
            let rt = {
                let mut r = real.borrow_mut();
                r.attached_to.retain(|t| t != vt);
                r.tuple
            };
            drop(real);
            self.maybe_destroy(&rt);
        }
    }

    /// Drop a real-service record once nothing references it: detached
    /// from every virtual service and no in-flight connection holds it.
    /// Its SNAT pool returns to the core allocator on drop.
    pub fn maybe_destroy(&mut self, rt: &Tuple2) {
        let destroy = match self.reals.find(rt) {
            Some(real) => real.borrow().attached_to.is_empty() && Rc::strong_count(real) == 1,
            None => false,
        };
        if destroy {
            self.reals.remove(rt);
        }
    }

    /// Pick a backend for a new client of `vs`
    pub fn select_real(&self, vs: &VirtualService, client: &Tuple2) -> Option<RealRef> {
        if vs.attached.is_empty() {
            return None;
        }
        let i = self.selector.select(client, vs.attached.len());
        vs.attached.get(i % vs.attached.len()).cloned()
    }

    /// Snapshot every virtual service
    pub fn list_virtual_services(&self) -> Vec<VirtualSnapshot> {
        self.virtuals
            .iter()
            .map(|(_, vs)| VirtualSnapshot {
                tuple: vs.tuple,
                attached: vs.attached.iter().map(|r| r.borrow().tuple).collect(),
            })
            .collect()
    }

    /// Snapshot the backends of one virtual service
    pub fn list_real_services(&self, vt: &Tuple2) -> ServiceResult<Vec<RealSnapshot>> {
        let vs = self
            .virtuals
            .find(vt)
            .ok_or_else(|| ServiceError::VirtualServiceNotFound(vt.to_string()))?;
        Ok(vs
            .attached
            .iter()
            .map(|r| {
                let r = r.borrow();
                RealSnapshot {
                    tuple: r.tuple,
                    pool_free: r.pool_free(),
                }
            })
            .collect())
    }
}

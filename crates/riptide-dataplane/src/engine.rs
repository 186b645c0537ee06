//! Core engine
//!
//! Run-to-completion packet processing with per-core isolation. Every
//! worker owns a full private instance of the service and connection
//! tables; nothing on the packet path crosses a core boundary. Core 0 is
//! the authoritative master: control-plane mutations apply there first and
//! replicate to the workers over the command rings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam::channel::bounded;
use thiserror::Error;
use tracing::{debug, info, warn};

use riptide_common::{BalancerConfig, ServiceError, ServiceResult, Tuple2};

use crate::channel::{Command, CommandReceiver, CommandRouter, Group, Replier};
use crate::connection::ConnTable;
use crate::conntrack::{Dir, FlagClass, Transition};
use crate::pipeline::{self, FramePort, Verdict};
use crate::service::{RealSnapshot, ServiceTable, VirtualSnapshot};
use crate::stats::{CoreStats, MetricsHub, ServiceMetrics};
use crate::wheel::TimerWheel;

/// Events scheduled in a core's timer wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// A connection's state timeout elapsed with no refreshing traffic
    ConnExpire(u32),
    /// Periodic metrics commit for one service
    MetricsCommit(Tuple2),
}

/// Everything one core owns.
///
/// Constructed inside the worker thread and never shared; the only ways in
/// are frames from the port and commands from the rings.
pub struct CoreContext {
    core_id: usize,
    is_master: bool,
    services: ServiceTable,
    conns: ConnTable,
    wheel: TimerWheel<TimerEvent>,
    stats: Arc<CoreStats>,
    hub: Arc<MetricsHub>,
    rx: CommandReceiver,
    router: Arc<CommandRouter>,
    tick_ms: u64,
    metrics_commit_ticks: u64,
}

impl CoreContext {
    /// Build a core's private world from the shared configuration
    pub fn new(
        core_id: usize,
        config: &BalancerConfig,
        rx: CommandReceiver,
        router: Arc<CommandRouter>,
        hub: Arc<MetricsHub>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            core_id,
            is_master: core_id == 0,
            services: ServiceTable::new(config, core_id),
            conns: ConnTable::new(config.max_connections),
            wheel: TimerWheel::new(),
            stats,
            hub,
            rx,
            router,
            tick_ms: config.tick_interval_ms.max(1),
            metrics_commit_ticks: config.metrics_commit_ticks.max(1),
        }
    }

    /// This core's id
    pub fn core_id(&self) -> usize {
        self.core_id
    }

    /// This core's service registry
    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    /// This core's connection table
    pub fn conns(&self) -> &ConnTable {
        &self.conns
    }

    /// Classify, track and NAT one frame in place
    pub fn process_frame(&mut self, frame: &mut BytesMut) -> Verdict {
        let Some(p) = pipeline::parse_frame(frame) else {
            return Verdict::Drop;
        };
        let class = FlagClass::from_tcp_flags(p.tcp_flags);

        let (slot, dir) = match self.conns.find(&p.tuple) {
            Some(slot) => {
                self.stats.conn_hits.fetch_add(1, Ordering::Relaxed);
                let Some(conn) = self.conns.get(slot) else {
                    return Verdict::Drop;
                };
                let dir = conn.direction_of(&p.tuple);
                match self.conns.transition(slot, dir, class) {
                    Transition::Invalid => return Verdict::Reset,
                    Transition::Ignore => {}
                    Transition::To(_) => self.schedule_conn_timeout(slot),
                }
                (slot, dir)
            }
            None => {
                self.stats.conn_misses.fetch_add(1, Ordering::Relaxed);
                // Only a fresh client SYN to a known virtual service
                // creates state; everything else without state is noise.
                if class != FlagClass::Syn {
                    return Verdict::Drop;
                }
                let Some(slot) =
                    self.conns
                        .ensure_connection_exists(&self.services, p.tuple.dst, p.tuple.src)
                else {
                    return Verdict::Drop;
                };
                self.stats.conn_creates.fetch_add(1, Ordering::Relaxed);
                // The creating SYN is consumed by construction: the new
                // connection starts in SynSent.
                self.schedule_conn_timeout(slot);
                (slot, Dir::Original)
            }
        };

        let Some(conn) = self.conns.get(slot) else {
            return Verdict::Drop;
        };
        match dir {
            Dir::Original => {
                conn.virtual_metrics.record_in(p.ip_len as u64);
                let real = conn.real.borrow();
                real.metrics.record_in(p.ip_len as u64);
                pipeline::rewrite_original(frame, &p, conn.local, real.tuple);
            }
            Dir::Reply => {
                conn.virtual_metrics.record_out(p.ip_len as u64);
                conn.real.borrow().metrics.record_out(p.ip_len as u64);
                pipeline::rewrite_reply(frame, &p, conn.virtual_tuple, conn.client);
            }
        }
        Verdict::Forward
    }

    /// (Re)schedule the connection's state timeout, with jitter so a burst
    /// of same-state connections does not expire on one tick
    fn schedule_conn_timeout(&mut self, slot: u32) {
        let (state, timer) = match self.conns.get(slot) {
            Some(c) => (c.state, c.timer),
            None => return,
        };
        let ticks = (state.timeout().as_millis() as u64 / self.tick_ms).max(1);
        let jitter = ticks / 16 + 1;
        let token = match timer {
            Some(tok) if self.wheel.reschedule_in_range(tok, ticks, ticks + jitter) => tok,
            _ => self
                .wheel
                .schedule_in_range(TimerEvent::ConnExpire(slot), ticks, ticks + jitter),
        };
        if let Some(c) = self.conns.get_mut(slot) {
            c.timer = Some(token);
        }
    }

    /// Advance the wheel and run everything that fired. Returns the number
    /// of fired events.
    pub fn advance_timers(&mut self, ticks: u64) -> usize {
        let fired = self.wheel.advance(ticks);
        let n = fired.len();
        for event in fired {
            match event {
                TimerEvent::ConnExpire(slot) => {
                    self.stats.conn_expires.fetch_add(1, Ordering::Relaxed);
                    if let Some(c) = self.conns.get_mut(slot) {
                        c.timer = None;
                    }
                    if let Some(real_tuple) = self.conns.expire(slot) {
                        self.services.maybe_destroy(&real_tuple);
                    }
                }
                TimerEvent::MetricsCommit(tuple) => {
                    // A withdrawn service simply stops committing.
                    if self.hub.commit(&tuple) {
                        self.wheel
                            .schedule(TimerEvent::MetricsCommit(tuple), self.metrics_commit_ticks);
                    }
                }
            }
        }
        n
    }

    /// Drain and apply every pending cross-core command
    pub fn sync_commands(&mut self) -> usize {
        let mut commands = Vec::new();
        let n = self.rx.sync(|cmd| commands.push(cmd));
        for cmd in commands {
            self.apply_command(cmd);
        }
        if n > 0 {
            self.stats
                .commands_applied
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        n
    }

    fn expose_metrics(&mut self, tuple: Tuple2, metrics: Arc<ServiceMetrics>) {
        if self.hub.expose(tuple, metrics) {
            self.wheel
                .schedule(TimerEvent::MetricsCommit(tuple), self.metrics_commit_ticks);
        }
    }

    /// Apply one control-plane command to this core's private tables.
    ///
    /// On the master this is the authoritative execution: it answers the
    /// reply channel and rebroadcasts successful mutations to the workers.
    /// On a worker a failed replay is logged and ignored; there is no
    /// cross-core reconciliation.
    pub fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddVirtualService { vs, metrics, reply } => {
                let existed = self.services.find_virtual_service(&vs).is_some();
                let res = self
                    .services
                    .ensure_virtual_service_exists(vs, metrics.clone())
                    .map(|_| ());
                if self.is_master {
                    if res.is_ok() && !existed {
                        info!(vip = %vs, "virtual service added");
                        self.expose_metrics(vs, metrics.clone());
                        self.router.broadcast(
                            Group::Workers,
                            &Command::AddVirtualService {
                                vs,
                                metrics,
                                reply: None,
                            },
                        );
                    }
                    if let Some(r) = reply {
                        let _ = r.send(res);
                    }
                } else if let Err(e) = res {
                    warn!(core = self.core_id, vip = %vs, error = %e,
                        "replicated add diverged from master");
                }
            }
            Command::RemoveVirtualService { vs, reply } => {
                let attached: Vec<Tuple2> = self
                    .services
                    .find_virtual_service(&vs)
                    .map(|v| v.attached().iter().map(|r| r.borrow().tuple).collect())
                    .unwrap_or_default();
                self.services.remove_virtual_service(&vs);
                if self.is_master {
                    info!(vip = %vs, "virtual service removed");
                    self.hub.withdraw(&vs);
                    for rt in &attached {
                        if self.services.is_detached(rt) {
                            self.hub.withdraw(rt);
                        }
                    }
                    self.router.broadcast(
                        Group::Workers,
                        &Command::RemoveVirtualService { vs, reply: None },
                    );
                    if let Some(r) = reply {
                        let _ = r.send(Ok(()));
                    }
                }
            }
            Command::AttachRealService {
                vs,
                rs,
                metrics,
                reply,
            } => {
                let res = self
                    .services
                    .ensure_real_service_exists(rs, metrics.clone())
                    .map(|_| ())
                    .and_then(|()| self.services.ensure_attached(&vs, &rs));
                if res.is_err() {
                    // Do not leave a freshly created backend dangling.
                    self.services.maybe_destroy(&rs);
                }
                if self.is_master {
                    if res.is_ok() {
                        info!(vip = %vs, real = %rs, "real service attached");
                        self.expose_metrics(rs, metrics.clone());
                        self.router.broadcast(
                            Group::Workers,
                            &Command::AttachRealService {
                                vs,
                                rs,
                                metrics,
                                reply: None,
                            },
                        );
                    }
                    if let Some(r) = reply {
                        let _ = r.send(res);
                    }
                } else if let Err(e) = res {
                    warn!(core = self.core_id, vip = %vs, real = %rs, error = %e,
                        "replicated attach diverged from master");
                }
            }
            Command::DetachRealService { vs, rs, reply } => {
                self.services.ensure_detached(&vs, &rs);
                if self.is_master {
                    info!(vip = %vs, real = %rs, "real service detached");
                    if self.services.is_detached(&rs) {
                        self.hub.withdraw(&rs);
                    }
                    self.router.broadcast(
                        Group::Workers,
                        &Command::DetachRealService {
                            vs,
                            rs,
                            reply: None,
                        },
                    );
                    if let Some(r) = reply {
                        let _ = r.send(Ok(()));
                    }
                }
            }
            Command::ListVirtualServices { reply } => {
                let _ = reply.send(self.services.list_virtual_services());
            }
            Command::ListRealServices { vs, reply } => {
                let _ = reply.send(self.services.list_real_services(&vs));
            }
        }
    }
}

/// Synchronous handle the RPC layer drives.
///
/// Every operation round-trips through the master core's command ring, so
/// results reflect the authoritative tables.
#[derive(Clone)]
pub struct ControlHandle {
    router: Arc<CommandRouter>,
    timeout: Duration,
}

impl ControlHandle {
    fn roundtrip(&self, make: impl FnOnce(Replier) -> Command) -> ServiceResult<()> {
        let (tx, rx) = bounded(1);
        self.router.broadcast(Group::Master, &make(tx));
        rx.recv_timeout(self.timeout)
            .map_err(|_| ServiceError::Unavailable)?
    }

    /// Create a virtual service (idempotent)
    pub fn add_virtual_service(&self, vs: Tuple2) -> ServiceResult<()> {
        self.roundtrip(|reply| Command::AddVirtualService {
            vs,
            metrics: Arc::new(ServiceMetrics::default()),
            reply: Some(reply),
        })
    }

    /// Remove a virtual service (no-op when absent)
    pub fn remove_virtual_service(&self, vs: Tuple2) -> ServiceResult<()> {
        self.roundtrip(|reply| Command::RemoveVirtualService {
            vs,
            reply: Some(reply),
        })
    }

    /// Create-if-needed and attach a real service
    pub fn attach_real_service(&self, vs: Tuple2, rs: Tuple2) -> ServiceResult<()> {
        self.roundtrip(|reply| Command::AttachRealService {
            vs,
            rs,
            metrics: Arc::new(ServiceMetrics::default()),
            reply: Some(reply),
        })
    }

    /// Detach a real service (no-op when not attached)
    pub fn detach_real_service(&self, vs: Tuple2, rs: Tuple2) -> ServiceResult<()> {
        self.roundtrip(|reply| Command::DetachRealService {
            vs,
            rs,
            reply: Some(reply),
        })
    }

    /// Snapshot the authoritative virtual-service table
    pub fn list_virtual_services(&self) -> ServiceResult<Vec<VirtualSnapshot>> {
        let (tx, rx) = bounded(1);
        self.router
            .broadcast(Group::Master, &Command::ListVirtualServices { reply: tx });
        rx.recv_timeout(self.timeout)
            .map_err(|_| ServiceError::Unavailable)
    }

    /// Snapshot the authoritative backends of one virtual service
    pub fn list_real_services(&self, vs: Tuple2) -> ServiceResult<Vec<RealSnapshot>> {
        let (tx, rx) = bounded(1);
        self.router
            .broadcast(Group::Master, &Command::ListRealServices { vs, reply: tx });
        rx.recv_timeout(self.timeout)
            .map_err(|_| ServiceError::Unavailable)?
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad configuration caught at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    core_id: usize,
}

/// The balancer engine: one pinned worker thread per core
pub struct Engine {
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    control: ControlHandle,
    hub: Arc<MetricsHub>,
    stats: Vec<Arc<CoreStats>>,
}

impl Engine {
    /// Start the engine. `port_factory` yields each core's frame port.
    pub fn start<P, F>(config: BalancerConfig, mut port_factory: F) -> Result<Self, EngineError>
    where
        P: FramePort + 'static,
        F: FnMut(usize) -> P,
    {
        if config.worker_cores == 0 {
            return Err(EngineError::Config("worker_cores must be at least 1".into()));
        }

        let mut router = CommandRouter::new();
        let mut receivers = Vec::with_capacity(config.worker_cores);
        for core in 0..config.worker_cores {
            let groups: &[Group] = if core == 0 {
                &[Group::Master, Group::All]
            } else {
                &[Group::Workers, Group::All]
            };
            receivers.push(router.register(core, groups, config.command_ring_depth));
        }
        let router = Arc::new(router);
        let hub = Arc::new(MetricsHub::new());
        let running = Arc::new(AtomicBool::new(true));

        let mut workers = Vec::with_capacity(config.worker_cores);
        let mut stats = Vec::with_capacity(config.worker_cores);
        for (core_id, rx) in receivers.into_iter().enumerate() {
            let core_stats = Arc::new(CoreStats::default());
            stats.push(core_stats.clone());
            let cfg = config.clone();
            let router = router.clone();
            let hub = hub.clone();
            let running = running.clone();
            let port = port_factory(core_id);
            let handle = thread::Builder::new()
                .name(format!("riptide-worker-{core_id}"))
                .spawn(move || {
                    let ctx = CoreContext::new(core_id, &cfg, rx, router, hub, core_stats);
                    run_worker(ctx, port, running);
                })
                .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
            workers.push(WorkerHandle {
                thread: Some(handle),
                core_id,
            });
        }

        info!(cores = config.worker_cores, "riptide engine started");
        Ok(Self {
            running,
            workers,
            control: ControlHandle {
                router,
                timeout: Duration::from_secs(5),
            },
            hub,
            stats,
        })
    }

    /// The control-plane handle
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// The metrics export registry
    pub fn hub(&self) -> Arc<MetricsHub> {
        self.hub.clone()
    }

    /// One core's data-path counters
    pub fn core_stats(&self, core_id: usize) -> Option<Arc<CoreStats>> {
        self.stats.get(core_id).cloned()
    }

    /// True while workers are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop and join every worker
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
            debug!(core = worker.core_id, "worker joined");
        }
        info!("riptide engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run-to-completion worker loop: frames, then commands, then timers
fn run_worker<P: FramePort>(mut ctx: CoreContext, mut port: P, running: Arc<AtomicBool>) {
    debug!(core = ctx.core_id, "worker starting");
    pin_to_core(ctx.core_id);

    let tick = Duration::from_millis(ctx.tick_ms);
    let mut last_tick = Instant::now();
    while running.load(Ordering::Relaxed) {
        let frames = port.receive(0);
        if !frames.is_empty() {
            let mut out = Vec::with_capacity(frames.len());
            for mut frame in frames {
                ctx.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
                match ctx.process_frame(&mut frame) {
                    Verdict::Forward => {
                        ctx.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                        out.push(frame);
                    }
                    Verdict::Drop => {
                        ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Verdict::Reset => {
                        ctx.stats.resets.fetch_add(1, Ordering::Relaxed);
                        if let Some(p) = pipeline::parse_frame(&frame) {
                            out.push(pipeline::build_rst(&frame, &p));
                        }
                    }
                }
            }
            if !out.is_empty() {
                port.send(0, out);
            }
        }

        ctx.sync_commands();

        let elapsed = last_tick.elapsed();
        let ticks = elapsed.as_millis() as u64 / ctx.tick_ms;
        if ticks > 0 {
            last_tick += tick * ticks as u32;
            ctx.advance_timers(ticks);
        }

        std::hint::spin_loop();
    }
    debug!(core = ctx.core_id, "worker stopped");
}

#[cfg(target_os = "linux")]
fn pin_to_core(core_id: usize) {
    // Affinity is handled by the deployment's core mask; record intent.
    debug!(core_id, "pinning worker thread");
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core_id: usize) {}

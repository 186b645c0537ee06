//! Cross-core command channel
//!
//! Control-plane mutations execute once on the authoritative master core,
//! then replicate to every worker's private tables through bounded
//! lock-free rings. One ring exists per (core, group) pair; each ring has
//! a single logical producer (the control plane or the master core) and a
//! single consumer (the owning core). Commands are never dropped: a full
//! ring is retried with a warning instead of failing.

use std::sync::Arc;

use crossbeam::channel::Sender;
use crossbeam::queue::ArrayQueue;
use tracing::warn;

use riptide_common::{ServiceResult, Tuple2};

use crate::service::{RealSnapshot, VirtualSnapshot};
use crate::stats::ServiceMetrics;

/// Logical destination groups for commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    /// The authoritative core (applies first, then rebroadcasts)
    Master,
    /// Every non-master core
    Workers,
    /// Every core
    All,
}

/// Synchronous reply channel carried by control-plane commands
pub type Replier = Sender<ServiceResult<()>>;

/// A replayable control-plane mutation (or query).
///
/// Mutations carry everything needed to apply them to a core's private
/// tables, including the shared metrics handle, so the replay on each
/// worker reconstructs an identical record. Queries are only ever sent to
/// the master ring.
#[derive(Clone)]
pub enum Command {
    /// Create a virtual service
    AddVirtualService {
        /// VIP endpoint
        vs: Tuple2,
        /// Counter block shared across cores
        metrics: Arc<ServiceMetrics>,
        /// Present only on the master-bound copy
        reply: Option<Replier>,
    },
    /// Remove a virtual service (no-op when absent)
    RemoveVirtualService {
        /// VIP endpoint
        vs: Tuple2,
        /// Present only on the master-bound copy
        reply: Option<Replier>,
    },
    /// Create-if-needed and attach a real service to a virtual service
    AttachRealService {
        /// VIP endpoint
        vs: Tuple2,
        /// Backend endpoint
        rs: Tuple2,
        /// Counter block shared across cores
        metrics: Arc<ServiceMetrics>,
        /// Present only on the master-bound copy
        reply: Option<Replier>,
    },
    /// Detach a real service (no-op when not attached)
    DetachRealService {
        /// VIP endpoint
        vs: Tuple2,
        /// Backend endpoint
        rs: Tuple2,
        /// Present only on the master-bound copy
        reply: Option<Replier>,
    },
    /// Snapshot the master's virtual services
    ListVirtualServices {
        /// Receives the snapshot
        reply: Sender<Vec<VirtualSnapshot>>,
    },
    /// Snapshot the backends of one virtual service on the master
    ListRealServices {
        /// VIP endpoint
        vs: Tuple2,
        /// Receives the snapshot
        reply: Sender<ServiceResult<Vec<RealSnapshot>>>,
    },
}

impl Command {
    /// The reply-less copy the master rebroadcasts to workers, or `None`
    /// for commands that do not replicate (queries).
    pub fn replicated(&self) -> Option<Command> {
        match self {
            Command::AddVirtualService { vs, metrics, .. } => Some(Command::AddVirtualService {
                vs: *vs,
                metrics: metrics.clone(),
                reply: None,
            }),
            Command::RemoveVirtualService { vs, .. } => Some(Command::RemoveVirtualService {
                vs: *vs,
                reply: None,
            }),
            Command::AttachRealService { vs, rs, metrics, .. } => {
                Some(Command::AttachRealService {
                    vs: *vs,
                    rs: *rs,
                    metrics: metrics.clone(),
                    reply: None,
                })
            }
            Command::DetachRealService { vs, rs, .. } => Some(Command::DetachRealService {
                vs: *vs,
                rs: *rs,
                reply: None,
            }),
            Command::ListVirtualServices { .. } | Command::ListRealServices { .. } => None,
        }
    }
}

struct RingEntry {
    core: usize,
    group: Group,
    queue: Arc<ArrayQueue<Command>>,
}

/// Producer side of every registered ring
#[derive(Default)]
pub struct CommandRouter {
    rings: Vec<RingEntry>,
}

impl CommandRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a core under `groups`, returning its consumer handle.
    /// Called once per core before the worker threads start.
    pub fn register(
        &mut self,
        core: usize,
        groups: &[Group],
        depth: usize,
    ) -> CommandReceiver {
        let mut queues = Vec::with_capacity(groups.len());
        for &group in groups {
            let queue = Arc::new(ArrayQueue::new(depth.max(1)));
            self.rings.push(RingEntry {
                core,
                group,
                queue: queue.clone(),
            });
            queues.push(queue);
        }
        CommandReceiver { queues }
    }

    /// Push a copy of `cmd` onto every ring registered under `group`.
    ///
    /// A momentarily full ring is spun on rather than dropped: losing a
    /// command would desynchronize that core's tables permanently, while
    /// the consumer drains its ring every scheduling round.
    pub fn broadcast(&self, group: Group, cmd: &Command) {
        for entry in self.rings.iter().filter(|e| e.group == group) {
            let mut pending = cmd.clone();
            loop {
                match entry.queue.push(pending) {
                    Ok(()) => break,
                    Err(back) => {
                        warn!(core = entry.core, ?group, "command ring full, retrying");
                        pending = back;
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Cores registered under `group`
    pub fn group_size(&self, group: Group) -> usize {
        self.rings.iter().filter(|e| e.group == group).count()
    }
}

/// Consumer side: all rings owned by one core
pub struct CommandReceiver {
    queues: Vec<Arc<ArrayQueue<Command>>>,
}

impl CommandReceiver {
    /// Drain every pending command through `apply`, returning the count
    /// processed. Called once per scheduling round by the owning core.
    pub fn sync(&self, mut apply: impl FnMut(Command)) -> usize {
        let mut processed = 0;
        for queue in &self.queues {
            while let Some(cmd) = queue.pop() {
                apply(cmd);
                processed += 1;
            }
        }
        processed
    }

    /// Pending commands across this core's rings
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

//! Riptide Fast Path
//!
//! Per-core, shared-nothing layer-4 load balancing: connection tracking,
//! service tables and NAT for tens of millions of packets per second.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        RIPTIDE ENGINE                            │
//! │                                                                  │
//! │   control plane ──▶ master ring ──▶ Core 0 (master)              │
//! │                                      │  apply + rebroadcast      │
//! │                         worker rings ▼                           │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐         │
//! │  │   Core 0      │  │   Core 1      │  │   Core N      │         │
//! │  │               │  │               │  │               │         │
//! │  │ ┌───────────┐ │  │ ┌───────────┐ │  │ ┌───────────┐ │         │
//! │  │ │ Svc Table │ │  │ │ Svc Table │ │  │ │ Svc Table │ │         │
//! │  │ ├───────────┤ │  │ ├───────────┤ │  │ ├───────────┤ │         │
//! │  │ │Conn Table │ │  │ │Conn Table │ │  │ │Conn Table │ │         │
//! │  │ ├───────────┤ │  │ ├───────────┤ │  │ ├───────────┤ │         │
//! │  │ │Timer Wheel│ │  │ │Timer Wheel│ │  │ │Timer Wheel│ │         │
//! │  │ └───────────┘ │  │ └───────────┘ │  │ └───────────┘ │         │
//! │  └───────────────┘  └───────────────┘  └───────────────┘         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every core owns a full private copy of the service and connection
//! tables; there is no shared memory and no lock anywhere on the packet
//! path. Control-plane mutations execute on the master core first, then
//! replicate to every worker over bounded lock-free rings.
//!
//! # Packet flow
//!
//! RX → parse → connection lookup by 4-tuple → (miss + SYN: virtual
//! service lookup, backend selection, SNAT allocation, connection
//! creation) → conntrack transition → NAT rewrite → TX.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod connection;
pub mod conntrack;
pub mod engine;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod table;
pub mod wheel;

pub use channel::{Command, CommandReceiver, CommandRouter, Group};
pub use connection::{ConnTable, Connection};
pub use conntrack::{next_state, Dir, FlagClass, TcpState, Transition};
pub use engine::{ControlHandle, CoreContext, Engine, EngineError, TimerEvent};
pub use pipeline::{FramePort, Verdict};
pub use service::{HashSelector, RealService, Selector, ServiceTable, VirtualService};
pub use stats::{CoreStats, MetricsHub, ServiceMetrics};
pub use table::FlowMap;
pub use wheel::{TimerToken, TimerWheel};

//! OpenSASE Miniflow Engine
//!
//! Collapses a multi-table rule chain into one merged hardware flow per
//! connection, and ages those flows out with the connections they serve.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          MINIFLOW ENGINE                             │
//! │                                                                      │
//! │  packet path (per context)          background                       │
//! │  ┌───────────────────┐             ┌──────────────────────────────┐  │
//! │  │ Accumulator       │  BuildReq   │ Merge workers (tokio)        │  │
//! │  │  rule/conn steps  ├────────────►│  resolve ► merge ► install   │  │
//! │  └─────────┬─────────┘   queue     │  ► link  (or roll back)      │  │
//! │            │ terminal              └───────┬──────────────┬───────┘  │
//! │            ▼                               │              │          │
//! │  ┌───────────────────┐   placeholder       ▼              ▼          │
//! │  │ Admission control ├──────────►┌──────────────┐ ┌──────────────┐   │
//! │  └───────────────────┘           │ Merge cache  │ │ Rule deps /  │   │
//! │                                  │ (ChainKey)   │ │ Conn table   │   │
//! │                                  └──────┬───────┘ └──────┬───────┘   │
//! │                                         │   teardown     │ aging     │
//! │                                         └───────◄────────┘           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Defaults
//!
//! | Setting | Default | Notes |
//! |---------|---------|-------|
//! | Chain length | 8 slots | Longer chains are not merged |
//! | Connection steps | 6 | Per chain |
//! | Fan-out | 2 destinations | Per merged flow |
//! | Queue | 40k merges | Pending merges before refusing |
//! | Cap | 1M merged flows | Installed plus pending |
//! | Idle timeout | 30 s | Connection aging |
//!
//! # Consistency
//!
//! 1. **Single build per chain**: a cache placeholder is claimed before work is queued
//! 2. **Optimistic versions**: constituents are re-validated after install and at link time
//! 3. **Idempotent teardown**: one atomic flag per merged flow
//! 4. **Shared connections**: one entry per connection, both directions

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod accumulator;
pub mod admission;
pub mod cache;
pub mod chain;
pub mod config;
pub mod conntrack;
pub mod deps;
pub mod engine;
pub mod error;
pub mod hw;
pub mod matching;
pub mod merge;
pub mod queue;
pub mod rules;
pub mod stats;
pub mod teardown;
pub mod tuple;
pub mod version;
pub mod worker;

#[cfg(test)]
mod testing;

pub use accumulator::{Accumulator, BuildRequest};
pub use admission::{Admission, AdmissionControl, AdmitAll};
pub use cache::{BeginBuild, FlowHandle, MergeCache, MergedFlow, Ticket};
pub use chain::{ChainKey, ChainSlot, RuleId};
pub use config::MiniflowConfig;
pub use conntrack::{ConnEntry, ConnTable, ConnTracker, TrackedConn};
pub use engine::{ChainStep, MiniflowEngine, StepVerdict};
pub use error::{ConfigError, ConnError, EngineError, HwError, MergeError, Resource};
pub use hw::{FlowInstaller, HwBinding, HwHandle, InstallTarget};
pub use merge::{merge_chain, Constituent, MergeLimits, MergedArtifact, TupleMatch};
pub use rules::{ActionFlags, CounterId, Destination, RuleSnapshot, RuleStore, TunnelInfo};
pub use stats::{MiniflowStats, MiniflowStatsSnapshot, Rejection};
pub use tuple::{ConnKey, ConnStep, FiveTuple, NatInfo, NatKind, PacketHeaders, Zone};
pub use version::VersionClock;

/// Maximum slots in one chain
pub const MAX_CHAIN_LEN: usize = 8;

/// Maximum connection steps in one chain
pub const MAX_CONN_DEPS: usize = 6;

/// Default forward destinations per merged flow
pub const DEFAULT_MAX_FANOUT: usize = 2;

/// Default header rewrites per merged flow
pub const DEFAULT_MAX_REWRITES: usize = 32;

/// Default pending merges before new ones are refused
pub const DEFAULT_QUEUE_CAPACITY: usize = 40_000;

/// Default cap on installed plus pending merged flows
pub const DEFAULT_MAX_MERGED_FLOWS: usize = 1 << 20; // 1M flows

/// Default connection idle timeout (seconds)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default merge worker tasks
pub const DEFAULT_WORKER_COUNT: usize = 16;

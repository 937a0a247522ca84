//! Constituent rules as seen by the merge engine
//!
//! Rules are owned by the classification layer. The engine only reads
//! versioned snapshots through [`RuleStore`] and records rule ids.

use crate::chain::RuleId;
use crate::matching::{HeaderRewrite, MatchSpec};

bitflags::bitflags! {
    /// Actions a rule (or merged flow) performs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActionFlags: u16 {
        /// Forward to the destination list
        const FWD_DEST = 1 << 0;
        /// Drop the packet
        const DROP = 1 << 1;
        /// Count hits
        const COUNT = 1 << 2;
        /// Apply header rewrites
        const MOD_HDR = 1 << 3;
        /// Encapsulate into a tunnel
        const ENCAP = 1 << 4;
        /// Decapsulate a tunnel
        const DECAP = 1 << 5;
        /// Push a VLAN tag
        const VLAN_PUSH = 1 << 6;
        /// Pop a VLAN tag
        const VLAN_POP = 1 << 7;
        /// Send through connection tracking
        const CT = 1 << 8;
        /// Continue in another chain
        const GOTO = 1 << 9;
    }
}

impl ActionFlags {
    /// Actions that only make sense between chain steps
    pub const CHAINING: ActionFlags = ActionFlags::CT.union(ActionFlags::GOTO);
}

/// Hardware counter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterId(pub u64);

/// Forward destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Egress port
    pub port: u32,
    /// Packets to this destination are encapsulated
    pub encap: bool,
}

impl Destination {
    /// Plain port destination
    pub const fn port(port: u32) -> Self {
        Self { port, encap: false }
    }
}

/// Tunnel encapsulation metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelInfo {
    /// Virtual network identifier
    pub vni: u32,
    /// Outer source address
    pub src_ip: u32,
    /// Outer destination address
    pub dst_ip: u32,
    /// Outer UDP destination port
    pub dst_port: u16,
}

/// Consistent view of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSnapshot {
    /// Rule id
    pub id: RuleId,
    /// Version stamped at creation or last modification
    pub version: u64,
    /// Match criteria
    pub matches: MatchSpec,
    /// Actions
    pub actions: ActionFlags,
    /// Header rewrites, in order
    pub rewrites: Vec<HeaderRewrite>,
    /// Forward destinations
    pub dests: Vec<Destination>,
    /// Destinations that split into mirror copies
    pub split_count: usize,
    /// Encapsulation metadata
    pub tunnel: Option<TunnelInfo>,
    /// The rule's own counter
    pub counter: Option<CounterId>,
}

impl RuleSnapshot {
    /// Bare rule with no match and no actions
    pub fn new(id: RuleId, version: u64) -> Self {
        Self {
            id,
            version,
            matches: MatchSpec::default(),
            actions: ActionFlags::empty(),
            rewrites: Vec::new(),
            dests: Vec::new(),
            split_count: 0,
            tunnel: None,
            counter: None,
        }
    }
}

/// Rule lifecycle collaborator
///
/// `lookup` must return a consistent snapshot without blocking the rule
/// writer; torn or stale reads are caught by the version check.
pub trait RuleStore: Send + Sync {
    /// Snapshot of a rule, `None` if it no longer exists
    fn lookup(&self, id: RuleId) -> Option<RuleSnapshot>;
}

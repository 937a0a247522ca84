//! Chain identity
//!
//! A chain is the ordered list of rules (and connection steps) one packet
//! traversed. Its key deduplicates identical chains across packets.

use heapless::Vec as FVec;

use crate::tuple::ConnKey;
use crate::MAX_CHAIN_LEN;

/// Classification rule identifier (the rule cookie). Zero is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u64);

impl RuleId {
    /// Whether this id can name a rule
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One step of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainSlot {
    /// Ordinary classification rule
    Rule(RuleId),
    /// Step that consulted a tracked connection
    Conn(ConnKey),
}

/// Full chain is the error value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainFull;

/// Ordered, fixed-capacity chain identity used as the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChainKey {
    slots: FVec<ChainSlot, MAX_CHAIN_LEN>,
}

impl ChainKey {
    /// Empty key
    pub const fn new() -> Self {
        Self { slots: FVec::new() }
    }

    /// Build from a slice; `None` if it does not fit
    pub fn from_slots(slots: &[ChainSlot]) -> Option<Self> {
        FVec::from_slice(slots).ok().map(|slots| Self { slots })
    }

    pub(crate) fn push(&mut self, slot: ChainSlot) -> Result<(), ChainFull> {
        self.slots.push(slot).map_err(|_| ChainFull)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Slots in traversal order
    pub fn slots(&self) -> &[ChainSlot] {
        &self.slots
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No slots yet
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether no more slots fit
    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    /// Ordinary rule ids in traversal order
    pub fn rules(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            ChainSlot::Rule(id) => Some(*id),
            ChainSlot::Conn(_) => None,
        })
    }

    /// Connection keys in traversal order
    pub fn conns(&self) -> impl Iterator<Item = ConnKey> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            ChainSlot::Conn(key) => Some(*key),
            ChainSlot::Rule(_) => None,
        })
    }
}

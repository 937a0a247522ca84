//! Flow-merge cache
//!
//! Maps a [`ChainKey`] to its merged flow. A key is claimed by inserting a
//! `Building` placeholder before any work is queued, so only one build per
//! chain can exist. Installed flows also live in a handle-indexed arena,
//! which lets teardown find a flow whose slot is still a placeholder.
//!
//! ```text
//!   try_begin_build ──► Building ──complete_build──► Ready ──evict/remove──► (gone)
//!                          │
//!                          └──abandon_build / evict──► (gone)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::chain::{ChainKey, RuleId};
use crate::conntrack::ConnEntry;
use crate::hw::HwBinding;
use crate::merge::MergedArtifact;

/// Arena handle of a merged flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowHandle(pub u64);

/// Installed merged flow
#[derive(Debug)]
pub struct MergedFlow {
    handle: FlowHandle,
    key: ChainKey,
    build_version: u64,
    artifact: MergedArtifact,
    hw: HwBinding,
    rules: Vec<RuleId>,
    conns: Vec<Weak<ConnEntry>>,
    cleanup: AtomicBool,
}

impl MergedFlow {
    /// Flow installed for `key`; cleanup not yet started
    pub fn new(
        handle: FlowHandle,
        key: ChainKey,
        build_version: u64,
        artifact: MergedArtifact,
        hw: HwBinding,
        conns: Vec<Weak<ConnEntry>>,
    ) -> Self {
        let mut rules: Vec<RuleId> = key.rules().collect();
        rules.sort_unstable();
        rules.dedup();
        Self {
            handle,
            key,
            build_version,
            artifact,
            hw,
            rules,
            conns,
            cleanup: AtomicBool::new(false),
        }
    }

    /// Arena handle
    pub fn handle(&self) -> FlowHandle {
        self.handle
    }

    /// Chain this flow was merged from
    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    /// Version clock reading the build was validated against
    pub fn build_version(&self) -> u64 {
        self.build_version
    }

    /// Merged rule as installed
    pub fn artifact(&self) -> &MergedArtifact {
        &self.artifact
    }

    /// Hardware rules
    pub fn hw(&self) -> &HwBinding {
        &self.hw
    }

    /// Distinct constituent rules
    pub fn rules(&self) -> &[RuleId] {
        &self.rules
    }

    /// Connection entries this flow depends on
    pub fn conns(&self) -> &[Weak<ConnEntry>] {
        &self.conns
    }

    /// Claim the cleanup; true for exactly one caller
    pub fn begin_cleanup(&self) -> bool {
        !self.cleanup.swap(true, Ordering::AcqRel)
    }

    /// Teardown has been claimed
    pub fn cleanup_started(&self) -> bool {
        self.cleanup.load(Ordering::Acquire)
    }
}

/// Right to build the merged flow for one key
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a ticket must be completed or abandoned"]
pub struct Ticket {
    key: ChainKey,
    handle: FlowHandle,
}

impl Ticket {
    /// Claimed key
    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    /// Handle the built flow will carry
    pub fn handle(&self) -> FlowHandle {
        self.handle
    }
}

/// Outcome of claiming a key
#[derive(Debug, PartialEq, Eq)]
pub enum BeginBuild {
    /// Caller owns the build
    Ticket(Ticket),
    /// Key is being built or already installed
    AlreadyPresent,
}

#[derive(Debug)]
enum SlotState {
    Building,
    Ready(Arc<MergedFlow>),
}

#[derive(Debug)]
struct Slot {
    handle: FlowHandle,
    state: SlotState,
}

/// Chain-keyed merged flow cache
#[derive(Debug, Default)]
pub struct MergeCache {
    slots: DashMap<ChainKey, Slot>,
    flows: DashMap<FlowHandle, Arc<MergedFlow>>,
    next_handle: AtomicU64,
}

impl MergeCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` with a placeholder if nobody holds it
    pub fn try_begin_build(&self, key: ChainKey) -> BeginBuild {
        match self.slots.entry(key) {
            Entry::Occupied(_) => BeginBuild::AlreadyPresent,
            Entry::Vacant(vacant) => {
                let handle = FlowHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
                let key = vacant.key().clone();
                vacant.insert(Slot {
                    handle,
                    state: SlotState::Building,
                });
                BeginBuild::Ticket(Ticket { key, handle })
            }
        }
    }

    /// Register an installed flow so teardown can reach it by handle
    pub fn publish(&self, flow: Arc<MergedFlow>) {
        self.flows.insert(flow.handle(), flow);
    }

    /// Make the flow visible under its key
    ///
    /// Fails if the placeholder is gone or the flow's cleanup already
    /// started; the placeholder is then removed.
    pub fn complete_build(&self, ticket: &Ticket, flow: Arc<MergedFlow>) -> bool {
        let Some(mut slot) = self.slots.get_mut(&ticket.key) else {
            return false;
        };
        if slot.handle != ticket.handle {
            return false;
        }
        if flow.cleanup_started() {
            drop(slot);
            self.abandon_build(ticket);
            return false;
        }
        slot.state = SlotState::Ready(flow);
        true
    }

    /// Drop the placeholder of a failed build
    pub fn abandon_build(&self, ticket: &Ticket) {
        self.slots.remove_if(&ticket.key, |_, slot| {
            slot.handle == ticket.handle && matches!(slot.state, SlotState::Building)
        });
    }

    /// Remove a ready flow by key
    pub fn remove(&self, key: &ChainKey) -> Option<Arc<MergedFlow>> {
        let (_, slot) = self
            .slots
            .remove_if(key, |_, slot| matches!(slot.state, SlotState::Ready(_)))?;
        self.flows.remove(&slot.handle);
        match slot.state {
            SlotState::Ready(flow) => Some(flow),
            SlotState::Building => None,
        }
    }

    /// Remove everything that refers to `flow`, placeholder or not
    pub fn evict(&self, flow: &MergedFlow) {
        let handle = flow.handle();
        self.slots.remove_if(flow.key(), |_, slot| slot.handle == handle);
        self.flows.remove(&handle);
    }

    /// Ready flow for `key`
    pub fn lookup(&self, key: &ChainKey) -> Option<Arc<MergedFlow>> {
        match &self.slots.get(key)?.state {
            SlotState::Ready(flow) => Some(Arc::clone(flow)),
            SlotState::Building => None,
        }
    }

    /// Published flow by handle
    pub fn get(&self, handle: FlowHandle) -> Option<Arc<MergedFlow>> {
        self.flows.get(&handle).map(|f| Arc::clone(f.value()))
    }

    /// Key is claimed by a build in progress
    pub fn is_building(&self, key: &ChainKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| matches!(slot.state, SlotState::Building))
            .unwrap_or(false)
    }

    /// Occupied slots, placeholders included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No slots, placeholders included
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Published flows
    pub fn installed(&self) -> usize {
        self.flows.len()
    }

    /// Snapshot of every published flow
    pub fn flows(&self) -> Vec<Arc<MergedFlow>> {
        self.flows.iter().map(|f| Arc::clone(f.value())).collect()
    }
}

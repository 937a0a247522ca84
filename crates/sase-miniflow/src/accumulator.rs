//! Per-context chain accumulator
//!
//! Each execution context (core, worker thread) owns one [`Accumulator`]
//! and threads it through the classifier callbacks for every packet. No
//! state is shared across contexts. Anything unusual about the chain
//! aborts it, and an aborted chain is never merged.

use heapless::Vec as FVec;

use crate::admission::Admission;
use crate::chain::{ChainKey, ChainSlot, RuleId};
use crate::rules::ActionFlags;
use crate::tuple::{ConnStep, FiveTuple, PacketHeaders};
use crate::{MAX_CHAIN_LEN, MAX_CONN_DEPS};

/// Everything a merge worker needs to rebuild a captured chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Chain identity
    pub key: ChainKey,
    /// Wire tuple of the triggering packet
    pub tuple: FiveTuple,
    /// Rule versions seen during traversal, in chain order
    pub versions: Vec<(RuleId, u64)>,
    /// Connection steps, in chain order
    pub conn_steps: Vec<ConnStep>,
    /// Version clock value captured at enqueue
    pub build_version: u64,
}

impl BuildRequest {
    /// Version recorded for `id` at traversal time
    pub fn recorded_version(&self, id: RuleId) -> Option<u64> {
        self.versions.iter().find(|(r, _)| *r == id).map(|(_, v)| *v)
    }
}

/// Chain under construction for one packet
#[derive(Debug, Default)]
pub struct Accumulator {
    key: ChainKey,
    versions: FVec<(RuleId, u64), MAX_CHAIN_LEN>,
    conn_steps: FVec<ConnStep, MAX_CONN_DEPS>,
    tuple: Option<FiveTuple>,
    aborted: bool,
}

impl Accumulator {
    /// Empty accumulator, ready for `begin`
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new packet
    pub fn begin(&mut self) {
        self.key.clear();
        self.versions.clear();
        self.conn_steps.clear();
        self.tuple = None;
        self.aborted = false;
    }

    /// Give up on this chain; later appends are ignored
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Chain can no longer be merged
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Slots recorded so far
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// No steps recorded yet
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Wire 5-tuple captured at the first step
    pub fn tuple(&self) -> Option<&FiveTuple> {
        self.tuple.as_ref()
    }

    /// Connection steps recorded so far
    pub fn conn_dependencies(&self) -> usize {
        self.conn_steps.len()
    }

    /// Capture the packet tuple; unsupported packets abort the chain
    pub fn capture_tuple(&mut self, headers: &PacketHeaders) {
        if self.aborted || self.tuple.is_some() {
            return;
        }
        match FiveTuple::extract(headers) {
            Ok(tuple) => self.tuple = Some(tuple),
            Err(reason) => {
                tracing::trace!("chain not mergeable: {}", reason);
                self.aborted = true;
            }
        }
    }

    /// Record one rule step
    pub fn append_rule(&mut self, id: RuleId, version: u64, actions: ActionFlags) {
        if self.aborted {
            return;
        }
        if !id.is_valid() || actions.contains(ActionFlags::DROP) {
            self.aborted = true;
            return;
        }
        if self.key.push(ChainSlot::Rule(id)).is_err() || self.versions.push((id, version)).is_err() {
            self.aborted = true;
        }
    }

    /// Record a step that consulted a tracked connection
    pub fn append_tuple_dependency(&mut self, step: ConnStep) {
        if self.aborted {
            return;
        }
        if self.conn_steps.push(step).is_err() || self.key.push(ChainSlot::Conn(step.key)).is_err() {
            self.aborted = true;
        }
    }

    /// On the terminal step, the key to merge, if the chain qualifies
    pub fn finish(&self, is_last_step: bool, admission: &dyn Admission) -> Option<ChainKey> {
        if !is_last_step || self.aborted || self.key.len() <= 1 || self.tuple.is_none() {
            return None;
        }
        admission.admit().ok()?;
        Some(self.key.clone())
    }

    /// Move the captured chain into a worker request and reset
    pub fn take_request(&mut self, build_version: u64) -> Option<BuildRequest> {
        let tuple = self.tuple?;
        let request = BuildRequest {
            key: std::mem::take(&mut self.key),
            tuple,
            versions: self.versions.iter().copied().collect(),
            conn_steps: self.conn_steps.iter().copied().collect(),
            build_version,
        };
        self.begin();
        Some(request)
    }
}

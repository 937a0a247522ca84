//! Rule dependents index
//!
//! Back-links from a constituent rule to the merged flows built on it. Each
//! rule's list is guarded by its own shard lock, never the whole cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::FlowHandle;
use crate::chain::RuleId;

/// Per-rule lists of dependent merged flows
#[derive(Debug, Default)]
pub struct RuleDependents {
    lists: DashMap<RuleId, Vec<FlowHandle>>,
}

impl RuleDependents {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `flow` to `rule`'s list if `verify` still holds under the list lock
    pub fn link(&self, rule: RuleId, flow: FlowHandle, verify: impl FnOnce() -> bool) -> bool {
        match self.lists.entry(rule) {
            Entry::Occupied(mut list) => {
                if !verify() {
                    return false;
                }
                list.get_mut().push(flow);
            }
            Entry::Vacant(slot) => {
                if !verify() {
                    return false;
                }
                slot.insert(vec![flow]);
            }
        }
        true
    }

    /// Remove one back-link
    pub fn unlink(&self, rule: RuleId, flow: FlowHandle) {
        if let Some(mut list) = self.lists.get_mut(&rule) {
            list.retain(|h| *h != flow);
        }
        self.lists.remove_if(&rule, |_, list| list.is_empty());
    }

    /// Take the whole list for a rule that is going away
    pub fn drain(&self, rule: RuleId) -> Vec<FlowHandle> {
        self.lists
            .remove(&rule)
            .map(|(_, list)| list)
            .unwrap_or_default()
    }

    /// Current dependents of `rule`
    pub fn dependents(&self, rule: RuleId) -> Vec<FlowHandle> {
        self.lists
            .get(&rule)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Rules with at least one dependent
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    /// No rule has dependents
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

//! Merged flow teardown
//!
//! Teardown is idempotent: whichever path wins the flow's cleanup flag
//! (rule removal, connection aging, worker rollback, shutdown) does the
//! work, every other caller returns immediately.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::MergedFlow;
use crate::chain::RuleId;
use crate::engine::Shared;
use crate::queue::Task;

/// Tears down merged flows against the engine's shared state
pub struct TeardownController<'a> {
    shared: &'a Shared,
}

impl<'a> TeardownController<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    /// A constituent rule is going away; queue teardown of its dependents
    ///
    /// Returns the number of merged flows affected. Once the queue is closed
    /// the flows are torn down on the calling thread.
    pub fn on_constituent_removed(&self, rule: RuleId) -> usize {
        let handles = self.shared.deps.drain(rule);
        for handle in &handles {
            self.schedule(Task::Teardown(*handle));
        }
        if !handles.is_empty() {
            tracing::debug!("rule {} removed, tearing down {} merged flows", rule, handles.len());
        }
        handles.len()
    }

    /// Queue teardown of one flow, falling back to inline teardown
    pub(crate) fn schedule(&self, task: Task) {
        self.shared.stats.record_teardown_enqueued();
        if let Err(Task::Teardown(handle)) = self.shared.queue.push(task) {
            if let Some(flow) = self.shared.cache.get(handle) {
                self.teardown(&flow);
            }
        }
    }

    /// Remove `flow` from hardware and from every index
    ///
    /// Returns false if another caller already owns the cleanup.
    pub fn teardown(&self, flow: &Arc<MergedFlow>) -> bool {
        if !flow.begin_cleanup() {
            return false;
        }
        let stats = &self.shared.stats;
        stats.teardowns_running.fetch_add(1, Ordering::AcqRel);

        self.shared.cache.evict(flow);

        let installer = &self.shared.installer;
        let hw = flow.hw();
        if !flow.artifact().counters.is_empty() {
            for handle in hw.handles() {
                installer.unlink_counters(handle);
            }
        }
        // Peer rule first; it mirrors the primary.
        for handle in hw.peer.into_iter().chain(std::iter::once(hw.primary)) {
            if let Err(e) = installer.uninstall(handle) {
                tracing::warn!("Failed to uninstall merged flow {:?} ({:?}): {}", flow.handle(), handle, e);
            }
        }

        for entry in flow.conns().iter().filter_map(|weak| weak.upgrade()) {
            self.shared.conns.unregister_dependent(&entry, flow.handle());
        }
        for rule in flow.rules() {
            self.shared.deps.unlink(*rule, flow.handle());
        }

        stats.record_uninstalled();
        stats.teardowns_completed.fetch_add(1, Ordering::Relaxed);
        stats.teardowns_running.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!("merged flow {:?} torn down", flow.handle());
        true
    }
}

//! Engine Statistics
//!
//! Lock-free counters for merge and teardown work. Admission control reads
//! the queue and installed gauges directly from here.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::error::MergeError;

/// Why a finished chain was not offered for merging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Dropped by the sampling knob
    Sampled,
    /// Merge queue at capacity
    QueueBusy,
    /// Installed plus queued merged flows at the cap
    AtCapacity,
}

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct MiniflowStats {
    /// Merge tasks ever queued
    pub merge_requests: AtomicU64,
    /// Teardown tasks ever queued
    pub teardown_requests: AtomicU64,

    /// Merge tasks queued or running
    pub merges_pending: AtomicUsize,
    /// Merges executing on a worker
    pub merges_running: AtomicUsize,
    /// Teardowns in progress
    pub teardowns_running: AtomicUsize,

    /// Builds that reached `Linked`
    pub merges_succeeded: AtomicU64,
    /// Teardowns run to completion
    pub teardowns_completed: AtomicU64,
    /// Merged flows currently installed in hardware
    pub in_hw: AtomicUsize,

    /// Rolled back: a constituent changed or vanished
    pub failed_stale: AtomicU64,
    /// Rolled back: fan-out or rewrite limit
    pub failed_resource: AtomicU64,
    /// Rolled back: device refused the rule
    pub failed_hw_reject: AtomicU64,
    /// Rolled back: a connection went away
    pub failed_dependency_dying: AtomicU64,

    /// Chains skipped by sampling
    pub rejected_sampled: AtomicU64,
    /// Chains refused while the queue was full
    pub rejected_busy: AtomicU64,
    /// Chains refused at the merged flow cap
    pub rejected_capacity: AtomicU64,

    /// Connections removed by aging
    pub conns_aged: AtomicU64,
}

impl MiniflowStats {
    /// Count a queued merge
    #[inline(always)]
    pub fn record_merge_enqueued(&self) {
        self.merge_requests.fetch_add(1, Ordering::Relaxed);
        self.merges_pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a queued teardown
    #[inline(always)]
    pub fn record_teardown_enqueued(&self) {
        self.teardown_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued merge finished, whatever the outcome
    #[inline(always)]
    pub fn record_merge_done(&self) {
        self.merges_pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// One more merged flow in hardware
    #[inline(always)]
    pub fn record_installed(&self) {
        self.in_hw.fetch_add(1, Ordering::AcqRel);
    }

    /// One merged flow left hardware
    #[inline(always)]
    pub fn record_uninstalled(&self) {
        self.in_hw.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count a refused chain
    #[inline(always)]
    pub fn record_rejection(&self, why: Rejection) {
        let counter = match why {
            Rejection::Sampled => &self.rejected_sampled,
            Rejection::QueueBusy => &self.rejected_busy,
            Rejection::AtCapacity => &self.rejected_capacity,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rolled-back build by cause
    pub fn record_failure(&self, err: &MergeError) {
        let counter = match err {
            MergeError::Stale => &self.failed_stale,
            MergeError::ResourceExhausted(_) => &self.failed_resource,
            MergeError::HardwareReject => &self.failed_hw_reject,
            MergeError::DependencyDying => &self.failed_dependency_dying,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Queued or running merges
    #[inline(always)]
    pub fn pending_merges(&self) -> usize {
        self.merges_pending.load(Ordering::Acquire)
    }

    /// Installed merged flows
    #[inline(always)]
    pub fn installed(&self) -> usize {
        self.in_hw.load(Ordering::Acquire)
    }

    /// Plain copy of every counter
    pub fn snapshot(&self) -> MiniflowStatsSnapshot {
        MiniflowStatsSnapshot {
            merge_requests: self.merge_requests.load(Ordering::Relaxed),
            teardown_requests: self.teardown_requests.load(Ordering::Relaxed),
            merges_pending: self.merges_pending.load(Ordering::Relaxed),
            merges_running: self.merges_running.load(Ordering::Relaxed),
            teardowns_running: self.teardowns_running.load(Ordering::Relaxed),
            merges_succeeded: self.merges_succeeded.load(Ordering::Relaxed),
            teardowns_completed: self.teardowns_completed.load(Ordering::Relaxed),
            in_hw: self.in_hw.load(Ordering::Relaxed),
            failed_stale: self.failed_stale.load(Ordering::Relaxed),
            failed_resource: self.failed_resource.load(Ordering::Relaxed),
            failed_hw_reject: self.failed_hw_reject.load(Ordering::Relaxed),
            failed_dependency_dying: self.failed_dependency_dying.load(Ordering::Relaxed),
            rejected_sampled: self.rejected_sampled.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
            rejected_capacity: self.rejected_capacity.load(Ordering::Relaxed),
            conns_aged: self.conns_aged.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiniflowStatsSnapshot {
    /// See [`MiniflowStats::merge_requests`]
    pub merge_requests: u64,
    /// See [`MiniflowStats::teardown_requests`]
    pub teardown_requests: u64,
    /// Merge tasks queued or running
    pub merges_pending: usize,
    /// Merges executing on a worker
    pub merges_running: usize,
    /// Teardowns in progress
    pub teardowns_running: usize,
    /// Builds that reached `Linked`
    pub merges_succeeded: u64,
    /// Teardowns run to completion
    pub teardowns_completed: u64,
    /// Merged flows installed in hardware
    pub in_hw: usize,
    /// Stale constituent rollbacks
    pub failed_stale: u64,
    /// Resource limit rollbacks
    pub failed_resource: u64,
    /// Hardware reject rollbacks
    pub failed_hw_reject: u64,
    /// Dying connection rollbacks
    pub failed_dependency_dying: u64,
    /// Chains skipped by sampling
    pub rejected_sampled: u64,
    /// Chains refused on a full queue
    pub rejected_busy: u64,
    /// Chains refused at the cap
    pub rejected_capacity: u64,
    /// Connections aged out
    pub conns_aged: u64,
}

impl MiniflowStatsSnapshot {
    /// Builds that ended rolled back
    pub fn failed(&self) -> u64 {
        self.failed_stale + self.failed_resource + self.failed_hw_reject + self.failed_dependency_dying
    }

    /// Share of finished merges that installed
    pub fn success_rate(&self) -> f64 {
        let total = self.merges_succeeded + self.failed();
        if total == 0 {
            return 0.0;
        }
        self.merges_succeeded as f64 / total as f64
    }

    /// Export as gauges through the `metrics` facade
    pub fn publish(&self) {
        metrics::gauge!("miniflow_merge_requests").set(self.merge_requests as f64);
        metrics::gauge!("miniflow_teardown_requests").set(self.teardown_requests as f64);
        metrics::gauge!("miniflow_merges_pending").set(self.merges_pending as f64);
        metrics::gauge!("miniflow_inflight", "kind" => "merge").set(self.merges_running as f64);
        metrics::gauge!("miniflow_inflight", "kind" => "teardown").set(self.teardowns_running as f64);
        metrics::gauge!("miniflow_merges_succeeded").set(self.merges_succeeded as f64);
        metrics::gauge!("miniflow_in_hw").set(self.in_hw as f64);
        metrics::gauge!("miniflow_failed", "kind" => "stale").set(self.failed_stale as f64);
        metrics::gauge!("miniflow_failed", "kind" => "resource").set(self.failed_resource as f64);
        metrics::gauge!("miniflow_failed", "kind" => "hw_reject").set(self.failed_hw_reject as f64);
        metrics::gauge!("miniflow_failed", "kind" => "dependency_dying")
            .set(self.failed_dependency_dying as f64);
        metrics::gauge!("miniflow_rejected", "cause" => "sampled").set(self.rejected_sampled as f64);
        metrics::gauge!("miniflow_rejected", "cause" => "busy").set(self.rejected_busy as f64);
        metrics::gauge!("miniflow_rejected", "cause" => "capacity").set(self.rejected_capacity as f64);
        metrics::gauge!("miniflow_conns_aged").set(self.conns_aged as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Resource;

    #[test]
    fn test_failure_kinds() {
        let stats = MiniflowStats::default();
        stats.record_failure(&MergeError::Stale);
        stats.record_failure(&MergeError::Stale);
        stats.record_failure(&MergeError::ResourceExhausted(Resource::Fanout));
        stats.record_failure(&MergeError::HardwareReject);
        stats.record_failure(&MergeError::DependencyDying);

        let snap = stats.snapshot();
        assert_eq!(snap.failed_stale, 2);
        assert_eq!(snap.failed_resource, 1);
        assert_eq!(snap.failed_hw_reject, 1);
        assert_eq!(snap.failed_dependency_dying, 1);
        assert_eq!(snap.failed(), 5);
    }

    #[test]
    fn test_pending_and_installed_gauges() {
        let stats = MiniflowStats::default();
        stats.record_merge_enqueued();
        stats.record_merge_enqueued();
        stats.record_merge_done();
        stats.record_installed();

        assert_eq!(stats.pending_merges(), 1);
        assert_eq!(stats.installed(), 1);
        assert_eq!(stats.snapshot().merge_requests, 2);

        stats.record_uninstalled();
        assert_eq!(stats.installed(), 0);
    }

    #[test]
    fn test_success_rate() {
        let snap = MiniflowStatsSnapshot {
            merges_succeeded: 3,
            failed_stale: 1,
            ..Default::default()
        };
        assert!((snap.success_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(MiniflowStatsSnapshot::default().success_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&MiniflowStats::default().snapshot()).unwrap();
        assert!(json.contains("\"in_hw\":0"));
    }

    #[test]
    fn test_publish_without_recorder() {
        MiniflowStats::default().snapshot().publish();
    }
}

//! Merge admission control
//!
//! Gate applied when a chain completes. Refusal is not an error: the packet
//! simply stays on the unmerged path.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;

use crate::config::MiniflowConfig;
use crate::stats::{MiniflowStats, Rejection};

/// Decides whether a finished chain may be queued for merging
pub trait Admission {
    /// `Ok` admits one merge request
    fn admit(&self) -> Result<(), Rejection>;
}

/// Admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmitAll;

impl Admission for AdmitAll {
    fn admit(&self) -> Result<(), Rejection> {
        Ok(())
    }
}

/// Sampling, queue depth and global cap checks against live config
pub struct AdmissionControl {
    config: Arc<ArcSwap<MiniflowConfig>>,
    stats: Arc<MiniflowStats>,
}

impl AdmissionControl {
    /// Admission against the live config and shared counters
    pub fn new(config: Arc<ArcSwap<MiniflowConfig>>, stats: Arc<MiniflowStats>) -> Self {
        Self { config, stats }
    }

    fn check(&self) -> Result<(), Rejection> {
        let config = self.config.load();

        if config.merge_sample_rate > 1
            && rand::thread_rng().gen_range(0..config.merge_sample_rate) != 0
        {
            return Err(Rejection::Sampled);
        }

        let pending = self.stats.pending_merges();
        if pending > config.queue_capacity {
            return Err(Rejection::QueueBusy);
        }
        if self.stats.installed() + pending >= config.max_merged_flows {
            return Err(Rejection::AtCapacity);
        }
        Ok(())
    }
}

impl Admission for AdmissionControl {
    fn admit(&self) -> Result<(), Rejection> {
        self.check().map_err(|why| {
            self.stats.record_rejection(why);
            why
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(config: MiniflowConfig) -> (AdmissionControl, Arc<MiniflowStats>) {
        let stats = Arc::new(MiniflowStats::default());
        let config = Arc::new(ArcSwap::from_pointee(config));
        (AdmissionControl::new(config, Arc::clone(&stats)), stats)
    }

    #[test]
    fn test_admits_when_idle() {
        let (ctl, _) = control(MiniflowConfig::default());
        assert_eq!(ctl.admit(), Ok(()));
    }

    #[test]
    fn test_queue_busy() {
        let (ctl, stats) = control(MiniflowConfig {
            queue_capacity: 2,
            ..Default::default()
        });
        stats.record_merge_enqueued();
        assert_eq!(ctl.admit(), Ok(()));
        stats.record_merge_enqueued();
        // A queue exactly at capacity still takes one more.
        assert_eq!(ctl.admit(), Ok(()));
        stats.record_merge_enqueued();
        assert_eq!(ctl.admit(), Err(Rejection::QueueBusy));
        assert_eq!(stats.snapshot().rejected_busy, 1);
    }

    #[test]
    fn test_global_cap_counts_installed_and_pending() {
        let (ctl, stats) = control(MiniflowConfig {
            max_merged_flows: 3,
            ..Default::default()
        });
        stats.record_installed();
        stats.record_installed();
        assert_eq!(ctl.admit(), Ok(()));

        stats.record_merge_enqueued();
        assert_eq!(ctl.admit(), Err(Rejection::AtCapacity));

        stats.record_merge_done();
        assert_eq!(ctl.admit(), Ok(()));
        assert_eq!(stats.snapshot().rejected_capacity, 1);
    }

    #[test]
    fn test_sampling_drops_most_chains() {
        let (ctl, stats) = control(MiniflowConfig {
            merge_sample_rate: 1000,
            ..Default::default()
        });
        let admitted = (0..1000).filter(|_| ctl.admit().is_ok()).count();
        assert!(admitted < 50, "admitted {admitted}");
        assert_eq!(stats.snapshot().rejected_sampled as usize, 1000 - admitted);
    }

    #[test]
    fn test_sample_rate_one_admits_all() {
        let (ctl, _) = control(MiniflowConfig {
            merge_sample_rate: 1,
            ..Default::default()
        });
        assert!((0..100).all(|_| ctl.admit().is_ok()));
    }

    #[test]
    fn test_live_reconfigure() {
        let stats = Arc::new(MiniflowStats::default());
        let config = Arc::new(ArcSwap::from_pointee(MiniflowConfig::default()));
        let ctl = AdmissionControl::new(Arc::clone(&config), Arc::clone(&stats));
        assert!(ctl.admit().is_ok());

        config.store(Arc::new(MiniflowConfig {
            max_merged_flows: 0,
            ..Default::default()
        }));
        assert_eq!(ctl.admit(), Err(Rejection::AtCapacity));
    }
}

//! Miniflow Engine
//!
//! Facade wiring the classifier callbacks, the merge cache, the worker pool
//! and the aging loop together. The packet path only touches the caller's
//! [`Accumulator`], the admission gate and one cache insert; everything else
//! runs on background workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::accumulator::Accumulator;
use crate::admission::AdmissionControl;
use crate::cache::{BeginBuild, MergeCache, MergedFlow};
use crate::chain::{ChainKey, RuleId};
use crate::config::MiniflowConfig;
use crate::conntrack::{ConnTable, ConnTracker};
use crate::deps::RuleDependents;
use crate::error::{ConfigError, EngineError};
use crate::hw::FlowInstaller;
use crate::queue::{spawn_workers, Task, WorkQueue};
use crate::rules::{ActionFlags, RuleStore};
use crate::stats::{MiniflowStats, MiniflowStatsSnapshot};
use crate::teardown::TeardownController;
use crate::tuple::{ConnKey, ConnStep, PacketHeaders};
use crate::version::VersionClock;
use crate::worker::MergeWorker;

/// Shortest aging tick
const MIN_AGING_INTERVAL: Duration = Duration::from_millis(10);

/// One rule step reported by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStep {
    /// Rule the packet matched
    pub rule: RuleId,
    /// Rule version at match time
    pub version: u64,
    /// Actions of the matched rule
    pub actions: ActionFlags,
    /// First step of a new packet
    pub is_first: bool,
    /// No further steps follow
    pub is_terminal: bool,
}

/// What the engine did with a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepVerdict {
    /// Chain still being recorded
    Continue,
    /// Chain not mergeable or not admitted
    Skipped,
    /// Merge request queued
    Queued,
    /// A merged flow for this chain exists or is being built
    Present,
}

/// State shared by the facade, the workers and the aging loop
pub(crate) struct Shared {
    pub(crate) config: Arc<ArcSwap<MiniflowConfig>>,
    pub(crate) clock: Arc<VersionClock>,
    pub(crate) stats: Arc<MiniflowStats>,
    pub(crate) admission: AdmissionControl,
    pub(crate) cache: MergeCache,
    pub(crate) conns: ConnTable,
    pub(crate) deps: RuleDependents,
    pub(crate) rules: Arc<dyn RuleStore>,
    pub(crate) installer: Arc<dyn FlowInstaller>,
    pub(crate) queue: WorkQueue,
}

impl Shared {
    pub(crate) fn new(
        config: MiniflowConfig,
        clock: Arc<VersionClock>,
        rules: Arc<dyn RuleStore>,
        tracker: Arc<dyn ConnTracker>,
        installer: Arc<dyn FlowInstaller>,
    ) -> (Self, mpsc::UnboundedReceiver<Task>) {
        let config = Arc::new(ArcSwap::from_pointee(config));
        let stats = Arc::new(MiniflowStats::default());
        let (queue, rx) = WorkQueue::new();
        let shared = Self {
            admission: AdmissionControl::new(Arc::clone(&config), Arc::clone(&stats)),
            config,
            clock,
            stats,
            cache: MergeCache::new(),
            conns: ConnTable::new(tracker),
            deps: RuleDependents::new(),
            rules,
            installer,
            queue,
        };
        (shared, rx)
    }

    /// Run one queued task
    pub(crate) fn execute(&self, task: Task) {
        match task {
            Task::Merge { request, ticket } => {
                self.stats.merges_running.fetch_add(1, Ordering::AcqRel);
                // Failures are counted and logged by the worker.
                let _ = MergeWorker::new(self).run(request, ticket);
                self.stats.merges_running.fetch_sub(1, Ordering::AcqRel);
                self.stats.record_merge_done();
            }
            Task::Teardown(handle) => {
                if let Some(flow) = self.cache.get(handle) {
                    TeardownController::new(self).teardown(&flow);
                }
            }
        }
        self.queue.complete();
    }

    /// One aging pass; returns the number of connections aged out
    pub(crate) fn age(&self, now: Instant) -> usize {
        let config = self.config.load();
        if !config.aging_enabled {
            return 0;
        }

        let report = self.conns.age_step(now, config.idle_timeout(), |handle| {
            self.cache
                .get(handle)
                .and_then(|flow| flow.hw().last_use(self.installer.as_ref()))
        });
        self.stats
            .conns_aged
            .fetch_add(report.expired as u64, Ordering::Relaxed);

        let teardown = TeardownController::new(self);
        for handle in report.released {
            teardown.schedule(Task::Teardown(handle));
        }
        report.expired
    }
}

/// Miniflow engine
///
/// Must be started from within a tokio runtime. Classifier callbacks are
/// synchronous and may be called from any thread.
pub struct MiniflowEngine {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    aging: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    stop: Arc<Notify>,
}

impl MiniflowEngine {
    /// Create an engine
    ///
    /// `clock` must be the clock the rule store stamps versions from.
    pub fn new(
        config: MiniflowConfig,
        clock: Arc<VersionClock>,
        rules: Arc<dyn RuleStore>,
        tracker: Arc<dyn ConnTracker>,
        installer: Arc<dyn FlowInstaller>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (shared, rx) = Shared::new(config, clock, rules, tracker, installer);
        Ok(Self {
            shared: Arc::new(shared),
            receiver: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
            aging: Mutex::new(None),
            running: AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Spawn the merge workers and the aging loop
    pub fn start(&self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }
        let Some(rx) = self.receiver.lock().take() else {
            self.running.store(false, Ordering::Release);
            return Err(EngineError::ShutDown);
        };

        let worker_count = self.shared.config.load().worker_count;
        let shared = Arc::clone(&self.shared);
        let exec = Arc::new(move |task: Task| shared.execute(task));
        *self.workers.lock() = spawn_workers(worker_count, rx, exec);
        *self.aging.lock() = Some(self.spawn_aging());

        tracing::info!("Miniflow engine started with {} workers", worker_count);
        Ok(())
    }

    fn spawn_aging(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        tokio::spawn(async move {
            let mut period = aging_period(&shared.config.load());
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {}
                }

                let config = shared.config.load();
                let wanted = aging_period(&config);
                if wanted != period {
                    period = wanted;
                    ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                }
                if config.aging_enabled {
                    let pass = Arc::clone(&shared);
                    if let Err(e) = tokio::task::spawn_blocking(move || pass.age(Instant::now())).await {
                        tracing::warn!("Miniflow aging pass failed: {}", e);
                    }
                }
            }
            tracing::debug!("miniflow aging loop stopped");
        })
    }

    /// Workers are up and shutdown has not begun
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Rule step callback
    pub fn on_chain_step(
        &self,
        acc: &mut Accumulator,
        headers: &PacketHeaders,
        step: ChainStep,
    ) -> StepVerdict {
        if step.is_first {
            acc.begin();
            acc.capture_tuple(headers);
        }
        acc.append_rule(step.rule, step.version, step.actions);
        self.complete_step(acc, step.is_terminal)
    }

    /// Connection-tracking step callback
    pub fn on_tuple_step(&self, acc: &mut Accumulator, step: ConnStep, is_terminal: bool) -> StepVerdict {
        acc.append_tuple_dependency(step);
        self.complete_step(acc, is_terminal)
    }

    fn complete_step(&self, acc: &mut Accumulator, is_terminal: bool) -> StepVerdict {
        if !is_terminal {
            return if acc.is_aborted() {
                StepVerdict::Skipped
            } else {
                StepVerdict::Continue
            };
        }

        let shared = &self.shared;
        let Some(key) = acc.finish(true, &shared.admission) else {
            acc.begin();
            return StepVerdict::Skipped;
        };

        let ticket = match shared.cache.try_begin_build(key) {
            BeginBuild::Ticket(ticket) => ticket,
            BeginBuild::AlreadyPresent => {
                acc.begin();
                return StepVerdict::Present;
            }
        };
        let Some(request) = acc.take_request(shared.clock.bump()) else {
            shared.cache.abandon_build(&ticket);
            return StepVerdict::Skipped;
        };

        shared.stats.record_merge_enqueued();
        match shared.queue.push(Task::Merge { request, ticket }) {
            Ok(()) => StepVerdict::Queued,
            Err(task) => {
                if let Task::Merge { ticket, .. } = task {
                    shared.cache.abandon_build(&ticket);
                }
                shared.stats.record_merge_done();
                StepVerdict::Skipped
            }
        }
    }

    /// A rule has been deleted or modified
    ///
    /// The rule store must already return the new state. Returns the number
    /// of merged flows scheduled for teardown.
    pub fn on_rule_removed(&self, rule: RuleId) -> usize {
        TeardownController::new(&self.shared).on_constituent_removed(rule)
    }

    /// Advance the version clock
    pub fn bump_version(&self) -> u64 {
        self.shared.clock.bump()
    }

    /// Clock shared with the rule store
    pub fn version_clock(&self) -> Arc<VersionClock> {
        Arc::clone(&self.shared.clock)
    }

    /// The tracker reports a connection destroyed
    pub fn mark_conn_dying(&self, key: &ConnKey) -> bool {
        self.shared.conns.mark_dying(key)
    }

    /// Run one aging pass now
    pub fn age_step(&self) -> usize {
        self.age_step_at(Instant::now())
    }

    /// Run one aging pass as if the time were `now`
    pub fn age_step_at(&self, now: Instant) -> usize {
        self.shared.age(now)
    }

    /// Installed merged flow for `key`
    pub fn lookup(&self, key: &ChainKey) -> Option<Arc<MergedFlow>> {
        self.shared.cache.lookup(key)
    }

    /// Installed merged flows
    pub fn installed(&self) -> usize {
        self.shared.cache.installed()
    }

    /// Tracked connections
    pub fn tracked_conns(&self) -> usize {
        self.shared.conns.offloaded_count()
    }

    /// Counter snapshot
    pub fn stats(&self) -> MiniflowStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Export the current counters as metrics gauges
    pub fn publish_metrics(&self) {
        self.shared.stats.snapshot().publish();
    }

    /// Current configuration
    pub fn config(&self) -> Arc<MiniflowConfig> {
        self.shared.config.load_full()
    }

    /// Swap in a new configuration
    ///
    /// Takes effect on the next admission check and aging tick. The worker
    /// count is fixed at `start`.
    pub fn reconfigure(&self, config: MiniflowConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.shared.config.store(Arc::new(config));
        tracing::info!("Miniflow configuration updated");
        Ok(())
    }

    /// Wait until every queued merge and teardown has run
    ///
    /// Only returns once the engine is started or the queue is empty.
    pub async fn flush(&self) {
        self.shared.queue.flush().await;
    }

    /// Stop workers and aging, then remove every merged flow
    pub async fn shutdown(&self) {
        self.shared.queue.close();
        self.stop.notify_one();

        // Backlog queued before the engine was ever started
        let backlog = self.receiver.lock().take();
        if let Some(mut rx) = backlog {
            while let Ok(task) = rx.try_recv() {
                self.shared.execute(task);
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Miniflow worker ended abnormally: {}", e);
            }
        }
        let aging = self.aging.lock().take();
        if let Some(aging) = aging {
            if let Err(e) = aging.await {
                tracing::warn!("Miniflow aging loop ended abnormally: {}", e);
            }
        }

        let teardown = TeardownController::new(&self.shared);
        let flows = self.shared.cache.flows();
        for flow in &flows {
            teardown.teardown(flow);
        }
        let report = self.shared.conns.drain();

        self.running.store(false, Ordering::Release);
        tracing::info!(
            "Miniflow engine stopped ({} merged flows removed, {} connections released)",
            flows.len(),
            report.expired
        );
    }
}

fn aging_period(config: &MiniflowConfig) -> Duration {
    config.aging_interval().max(MIN_AGING_INTERVAL)
}

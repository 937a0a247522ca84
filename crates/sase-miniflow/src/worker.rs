//! Merge worker
//!
//! Builds one merged flow per cache ticket as an explicit state machine:
//!
//! ```text
//!  Resolving ──► Merging ──► Installing ──► Linked
//!      │            │             │
//!      └────────────┴─────────────┴──────► RolledBack
//! ```
//!
//! Constituents are read without locks and validated against the versions
//! recorded while the packet traversed the chain. They are validated again
//! after installation and once more under each rule's dependents lock, so a
//! rule deleted or modified at any point during the build is never linked.

use std::sync::Arc;

use crate::accumulator::BuildRequest;
use crate::cache::{MergedFlow, Ticket};
use crate::chain::{ChainSlot, RuleId};
use crate::conntrack::ConnEntry;
use crate::engine::Shared;
use crate::error::{MergeError, MergeResult};
use crate::hw::{HwBinding, InstallTarget};
use crate::merge::{merge_chain, Constituent, MergeLimits, MergedArtifact};
use crate::rules::RuleSnapshot;
use crate::teardown::TeardownController;

/// Constituents looked up and validated
#[derive(Debug)]
pub struct Resolved {
    request: BuildRequest,
    constituents: Vec<Constituent>,
    conns: Vec<Arc<ConnEntry>>,
}

/// Merged artifact waiting for installation
#[derive(Debug)]
pub struct Merged {
    request: BuildRequest,
    conns: Vec<Arc<ConnEntry>>,
    artifact: MergedArtifact,
}

/// Build phase
#[derive(Debug)]
pub enum BuildState {
    /// Looking up constituents
    Resolving(BuildRequest),
    /// Folding constituents into one artifact
    Merging(Resolved),
    /// Programming hardware and linking back-references
    Installing(Merged),
    /// Published and reachable from every dependency
    Linked(Arc<MergedFlow>),
    /// Failed; nothing left behind
    RolledBack(MergeError),
}

impl BuildState {
    /// Phase name for logs
    pub fn name(&self) -> &'static str {
        match self {
            BuildState::Resolving(_) => "resolving",
            BuildState::Merging(_) => "merging",
            BuildState::Installing(_) => "installing",
            BuildState::Linked(_) => "linked",
            BuildState::RolledBack(_) => "rolled-back",
        }
    }

    /// Linked or rolled back
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Linked(_) | BuildState::RolledBack(_))
    }

    /// Advance one phase
    pub fn step(self, worker: &MergeWorker<'_>, ticket: &Ticket) -> BuildState {
        let next = match self {
            BuildState::Resolving(request) => worker.resolve(request).map(BuildState::Merging),
            BuildState::Merging(resolved) => worker.merge(resolved).map(BuildState::Installing),
            BuildState::Installing(merged) => worker.install_and_link(merged, ticket).map(BuildState::Linked),
            terminal => Ok(terminal),
        };
        next.unwrap_or_else(BuildState::RolledBack)
    }
}

/// Runs builds against the engine's shared state
pub struct MergeWorker<'a> {
    shared: &'a Shared,
}

impl<'a> MergeWorker<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    /// Drive one build to a terminal state
    pub fn run(&self, request: BuildRequest, ticket: Ticket) -> MergeResult<Arc<MergedFlow>> {
        let mut state = BuildState::Resolving(request);
        loop {
            state = match state {
                BuildState::Linked(flow) => {
                    self.shared.stats.merges_succeeded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::debug!(
                        "merged flow {:?} linked ({} slots, version {})",
                        flow.handle(),
                        flow.key().len(),
                        flow.build_version()
                    );
                    return Ok(flow);
                }
                BuildState::RolledBack(err) => {
                    self.shared.cache.abandon_build(&ticket);
                    self.shared.stats.record_failure(&err);
                    tracing::debug!("merge {:?} rolled back: {}", ticket.handle(), err);
                    return Err(err);
                }
                other => other.step(self, &ticket),
            };
        }
    }

    fn verify_rule(&self, id: RuleId, request: &BuildRequest) -> MergeResult<RuleSnapshot> {
        let rule = self.shared.rules.lookup(id).ok_or(MergeError::Stale)?;
        if rule.version > request.build_version || request.recorded_version(id) != Some(rule.version) {
            return Err(MergeError::Stale);
        }
        Ok(rule)
    }

    fn verify_all(&self, request: &BuildRequest) -> MergeResult<()> {
        request
            .key
            .rules()
            .try_for_each(|id| self.verify_rule(id, request).map(|_| ()))
    }

    fn resolve(&self, request: BuildRequest) -> MergeResult<Resolved> {
        let track = self.shared.config.load().aging_enabled;
        let mut constituents: Vec<Constituent> = Vec::with_capacity(request.key.len());
        let mut conns = Vec::new();
        let mut steps = request.conn_steps.iter();

        for slot in request.key.slots() {
            match slot {
                ChainSlot::Rule(id) => {
                    constituents.push(self.verify_rule(*id, &request)?.into());
                }
                ChainSlot::Conn(key) => {
                    let step = steps.next().filter(|s| s.key == *key).ok_or(MergeError::Stale)?;
                    if track {
                        conns.push(self.shared.conns.lookup_or_create(key)?);
                    }
                    constituents.push(Constituent::from_conn(step));
                }
            }
        }

        Ok(Resolved {
            request,
            constituents,
            conns,
        })
    }

    fn merge(&self, resolved: Resolved) -> MergeResult<Merged> {
        let config = self.shared.config.load();
        let limits = MergeLimits {
            max_fanout: config.max_fanout,
            max_rewrites: config.max_rewrites,
        };
        let artifact = merge_chain(&resolved.constituents, resolved.request.tuple, limits)?;
        Ok(Merged {
            request: resolved.request,
            conns: resolved.conns,
            artifact,
        })
    }

    fn install(&self, artifact: &MergedArtifact) -> MergeResult<HwBinding> {
        let installer = &self.shared.installer;
        let primary = installer
            .install(artifact, InstallTarget::Primary)
            .map_err(|e| {
                tracing::debug!("merged flow install failed: {}", e);
                MergeError::HardwareReject
            })?;

        let peer = if installer.needs_peer(artifact) {
            match installer.install(artifact, InstallTarget::Peer) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::debug!("peer install failed, rolling back primary: {}", e);
                    if let Err(e) = installer.uninstall(primary) {
                        tracing::warn!("Failed to roll back primary install: {}", e);
                    }
                    return Err(MergeError::HardwareReject);
                }
            }
        } else {
            None
        };

        Ok(HwBinding { primary, peer })
    }

    fn uninstall(&self, hw: &HwBinding) {
        for handle in hw.handles() {
            if let Err(e) = self.shared.installer.uninstall(handle) {
                tracing::warn!("Failed to uninstall {:?}: {}", handle, e);
            }
        }
    }

    fn install_and_link(&self, merged: Merged, ticket: &Ticket) -> MergeResult<Arc<MergedFlow>> {
        let Merged {
            request,
            conns,
            artifact,
        } = merged;

        let hw = self.install(&artifact)?;
        if let Err(e) = self.verify_all(&request) {
            self.uninstall(&hw);
            return Err(e);
        }
        if !artifact.counters.is_empty() {
            for handle in hw.handles() {
                self.shared.installer.link_counters(handle, &artifact.counters);
            }
        }

        let flow = Arc::new(MergedFlow::new(
            ticket.handle(),
            request.key.clone(),
            request.build_version,
            artifact,
            hw,
            conns.iter().map(Arc::downgrade).collect(),
        ));
        self.shared.cache.publish(Arc::clone(&flow));
        self.shared.stats.record_installed();

        let teardown = TeardownController::new(self.shared);
        let handle = flow.handle();

        // Rules first, then connections. Teardown raises the cleanup flag
        // before it unlinks, so a link made under the same lock either sees
        // the flag or is removed by that teardown.
        for id in flow.rules() {
            let linked = self.shared.deps.link(*id, handle, || {
                !flow.cleanup_started() && self.verify_rule(*id, &request).is_ok()
            });
            if !linked {
                let err = if flow.cleanup_started() {
                    MergeError::DependencyDying
                } else {
                    MergeError::Stale
                };
                teardown.teardown(&flow);
                return Err(err);
            }
        }
        for entry in &conns {
            if let Err(e) = self.shared.conns.register_dependent(entry, handle) {
                teardown.teardown(&flow);
                return Err(e.into());
            }
            if flow.cleanup_started() {
                self.shared.conns.unregister_dependent(entry, handle);
                return Err(MergeError::DependencyDying);
            }
        }

        if !self.shared.cache.complete_build(ticket, Arc::clone(&flow)) {
            teardown.teardown(&flow);
            return Err(MergeError::DependencyDying);
        }
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BeginBuild;
    use crate::chain::ChainKey;
    use crate::config::MiniflowConfig;
    use crate::engine::tests::Harness;
    use crate::matching::{HeaderMatch, HeaderRewrite, MatchField, MatchLevel, MatchSpec, RewriteField};
    use crate::rules::{ActionFlags, CounterId, Destination};
    use crate::tuple::{ConnKey, ConnStep, FiveTuple, Zone, IPPROTO_TCP};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn tuple() -> FiveTuple {
        FiveTuple::new(0x01010101, 0x02020202, 40000, 80, IPPROTO_TCP)
    }

    fn request(h: &Harness, rules: &[&RuleSnapshot], conn: Option<ConnStep>) -> (BuildRequest, Ticket) {
        let mut slots: Vec<ChainSlot> = rules.iter().map(|r| ChainSlot::Rule(r.id)).collect();
        if let Some(step) = conn {
            slots.push(ChainSlot::Conn(step.key));
        }
        let key = ChainKey::from_slots(&slots).unwrap();
        let ticket = match h.shared.cache.try_begin_build(key.clone()) {
            BeginBuild::Ticket(t) => t,
            BeginBuild::AlreadyPresent => panic!("key already claimed"),
        };
        let request = BuildRequest {
            key,
            tuple: tuple(),
            versions: rules.iter().map(|r| (r.id, r.version)).collect(),
            conn_steps: conn.into_iter().collect(),
            build_version: h.shared.clock.bump(),
        };
        (request, ticket)
    }

    fn rule_a(h: &Harness) -> RuleSnapshot {
        let mut r = RuleSnapshot::new(RuleId(0xa), 0);
        r.matches = MatchSpec::outer(HeaderMatch::new().with(MatchField::SrcIpv4, 0x01010101), MatchLevel::L3);
        r.actions = ActionFlags::FWD_DEST | ActionFlags::COUNT;
        r.dests = vec![Destination::port(1)];
        r.counter = Some(CounterId(100));
        h.rules.put(r)
    }

    fn rule_b(h: &Harness) -> RuleSnapshot {
        let mut r = RuleSnapshot::new(RuleId(0xb), 0);
        r.matches = MatchSpec::outer(
            HeaderMatch::new().with(MatchField::IpProto, IPPROTO_TCP as u64),
            MatchLevel::L3,
        );
        r.actions = ActionFlags::MOD_HDR;
        r.rewrites = vec![HeaderRewrite::new(RewriteField::TcpDport, 8080)];
        h.rules.put(r)
    }

    #[test]
    fn test_build_links_everything() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);
        let key = req.key.clone();

        let flow = MergeWorker::new(&h.shared).run(req, ticket).unwrap();

        let art = flow.artifact();
        assert_eq!(art.matches.outer.get(MatchField::SrcIpv4).unwrap().value, 0x01010101);
        assert_eq!(art.matches.outer.get(MatchField::IpProto).unwrap().value, 6);
        assert!(!art.matches.outer.contains(MatchField::TcpDport));
        assert_eq!(art.actions, ActionFlags::FWD_DEST | ActionFlags::COUNT | ActionFlags::MOD_HDR);

        assert!(Arc::ptr_eq(&h.shared.cache.lookup(&key).unwrap(), &flow));
        assert_eq!(h.shared.deps.dependents(a.id), vec![flow.handle()]);
        assert_eq!(h.shared.deps.dependents(b.id), vec![flow.handle()]);
        assert_eq!(h.installer.live(), 1);
        assert_eq!(
            h.installer.links.lock().get(&flow.hw().primary),
            Some(&vec![CounterId(100)])
        );
        assert_eq!(h.shared.stats.installed(), 1);
        assert_eq!(h.shared.stats.snapshot().merges_succeeded, 1);
    }

    #[test]
    fn test_missing_rule_is_stale() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);
        let key = req.key.clone();
        h.rules.remove(a.id);

        assert_eq!(MergeWorker::new(&h.shared).run(req, ticket).unwrap_err(), MergeError::Stale);
        assert!(h.shared.cache.is_empty());
        assert_eq!(h.installer.live(), 0);
        assert!(!h.shared.cache.is_building(&key));
        assert_eq!(h.shared.stats.snapshot().failed_stale, 1);
    }

    #[test]
    fn test_modified_rule_is_stale() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);
        h.rules.touch(b.id);

        assert_eq!(MergeWorker::new(&h.shared).run(req, ticket).unwrap_err(), MergeError::Stale);
        assert_eq!(h.installer.installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rule_deleted_during_install_rolls_back() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);

        let rules = Arc::clone(&h.rules);
        h.installer.set_hook(move |_| {
            rules.remove(RuleId(0xa));
        });

        assert_eq!(MergeWorker::new(&h.shared).run(req, ticket).unwrap_err(), MergeError::Stale);
        assert_eq!(h.installer.installs.load(Ordering::SeqCst), 1);
        assert_eq!(h.installer.live(), 0);
        assert!(h.shared.cache.is_empty());
        assert!(h.shared.deps.is_empty());
        assert_eq!(h.shared.stats.installed(), 0);
    }

    #[test]
    fn test_fanout_exhausted() {
        let h = Harness::new(MiniflowConfig {
            max_fanout: 1,
            ..Default::default()
        });
        let a = rule_a(&h);
        let mut c = RuleSnapshot::new(RuleId(0xc), 0);
        c.actions = ActionFlags::FWD_DEST;
        c.dests = vec![Destination::port(2)];
        let c = h.rules.put(c);
        let (req, ticket) = request(&h, &[&a, &c], None);

        let err = MergeWorker::new(&h.shared).run(req, ticket).unwrap_err();
        assert!(matches!(err, MergeError::ResourceExhausted(_)));
        assert_eq!(h.installer.installs.load(Ordering::SeqCst), 0);
        assert!(h.shared.cache.is_empty());
    }

    #[test]
    fn test_hardware_reject() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);
        h.installer.fail_primary.store(true, Ordering::SeqCst);

        let err = MergeWorker::new(&h.shared).run(req, ticket).unwrap_err();
        assert_eq!(err, MergeError::HardwareReject);
        assert!(h.installer.rejected(InstallTarget::Primary));
        assert!(h.shared.cache.is_empty());
        assert_eq!(h.shared.stats.snapshot().failed_hw_reject, 1);
    }

    #[test]
    fn test_peer_failure_rolls_back_primary() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);
        h.installer.peer.store(true, Ordering::SeqCst);
        h.installer.fail_peer.store(true, Ordering::SeqCst);

        let err = MergeWorker::new(&h.shared).run(req, ticket).unwrap_err();
        assert_eq!(err, MergeError::HardwareReject);
        assert_eq!(h.installer.installs.load(Ordering::SeqCst), 1);
        assert_eq!(h.installer.uninstall_count(), 1);
        assert_eq!(h.installer.live(), 0);
    }

    #[test]
    fn test_peer_install() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let (req, ticket) = request(&h, &[&a, &b], None);
        h.installer.peer.store(true, Ordering::SeqCst);

        let flow = MergeWorker::new(&h.shared).run(req, ticket).unwrap();
        assert!(flow.hw().peer.is_some());
        assert_eq!(h.installer.live(), 2);
        assert_eq!(h.installer.links.lock().len(), 2);
    }

    #[test]
    fn test_conn_dependency_registered() {
        let h = Harness::new(MiniflowConfig::default());
        let a = rule_a(&h);
        let conn = ConnKey::new(tuple(), Zone(2));
        h.tracker.add(conn);
        let step = ConnStep { key: conn, nat: None };
        let (req, ticket) = request(&h, &[&a], Some(step));

        let flow = MergeWorker::new(&h.shared).run(req, ticket).unwrap();
        let entry = h.shared.conns.lookup(&conn).unwrap();
        assert_eq!(entry.dependents(), vec![flow.handle()]);
        assert_eq!(flow.conns().len(), 1);
    }

    #[test]
    fn test_unknown_connection() {
        let h = Harness::new(MiniflowConfig::default());
        let a = rule_a(&h);
        let step = ConnStep {
            key: ConnKey::new(tuple(), Zone(2)),
            nat: None,
        };
        let (req, ticket) = request(&h, &[&a], Some(step));

        let err = MergeWorker::new(&h.shared).run(req, ticket).unwrap_err();
        assert_eq!(err, MergeError::DependencyDying);
        assert_eq!(h.installer.installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dying_connection_rolls_back() {
        let h = Harness::new(MiniflowConfig::default());
        let a = rule_a(&h);
        let conn = ConnKey::new(tuple(), Zone(2));
        h.tracker.add(conn);
        let (req, ticket) = request(&h, &[&a], Some(ConnStep { key: conn, nat: None }));

        let shared = Arc::clone(&h.shared);
        h.installer.set_hook(move |_| {
            shared.conns.mark_dying(&conn);
        });

        let err = MergeWorker::new(&h.shared).run(req, ticket).unwrap_err();
        assert_eq!(err, MergeError::DependencyDying);
        assert_eq!(h.installer.live(), 0);
        assert!(h.shared.cache.is_empty());
        assert!(h.shared.deps.is_empty());
        assert_eq!(h.shared.stats.installed(), 0);
    }

    #[test]
    fn test_aging_disabled_skips_tuple_table() {
        let h = Harness::new(MiniflowConfig {
            aging_enabled: false,
            ..Default::default()
        });
        let a = rule_a(&h);
        let conn = ConnKey::new(tuple(), Zone(2));
        let (req, ticket) = request(&h, &[&a], Some(ConnStep { key: conn, nat: None }));

        let flow = MergeWorker::new(&h.shared).run(req, ticket).unwrap();
        assert!(flow.conns().is_empty());
        assert!(h.shared.conns.is_empty());
    }

    #[test]
    fn test_concurrent_aging_leaves_no_back_links() {
        let h = Harness::new(MiniflowConfig::default());
        let (a, b) = (rule_a(&h), rule_b(&h));
        let conn = ConnKey::new(tuple(), Zone(2));
        h.tracker.add(conn);

        let stop = Arc::new(AtomicBool::new(false));
        let ager = {
            let shared = Arc::clone(&h.shared);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let teardown = TeardownController::new(&shared);
                while !stop.load(Ordering::Acquire) {
                    for handle in shared.conns.drain().released {
                        if let Some(flow) = shared.cache.get(handle) {
                            teardown.teardown(&flow);
                        }
                    }
                    thread::yield_now();
                }
            })
        };

        for _ in 0..20_000 {
            let (req, ticket) = request(&h, &[&a, &b], Some(ConnStep { key: conn, nat: None }));
            let key = req.key.clone();
            let _ = MergeWorker::new(&h.shared).run(req, ticket);
            if let Some(flow) = h.shared.cache.lookup(&key) {
                TeardownController::new(&h.shared).teardown(&flow);
            }
        }
        stop.store(true, Ordering::Release);
        ager.join().unwrap();

        assert!(h.shared.cache.is_empty());
        assert!(h.shared.deps.dependents(a.id).is_empty());
        assert!(h.shared.deps.dependents(b.id).is_empty());
        assert!(h.shared.deps.is_empty());
        if let Some(entry) = h.shared.conns.lookup(&conn) {
            assert!(entry.dependents().is_empty());
        }
        assert_eq!(h.installer.live(), 0);
        assert_eq!(h.shared.stats.installed(), 0);
    }

    #[test]
    fn test_state_names() {
        let state = BuildState::RolledBack(MergeError::Stale);
        assert!(state.is_terminal());
        assert_eq!(state.name(), "rolled-back");
    }
}

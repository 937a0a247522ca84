//! In-memory collaborators for unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::chain::RuleId;
use crate::conntrack::{ConnTracker, TrackedConn};
use crate::error::HwError;
use crate::hw::{FlowInstaller, HwBinding, HwHandle, InstallTarget};
use crate::matching::MatchSpec;
use crate::merge::{MergedArtifact, TupleMatch};
use crate::rules::{ActionFlags, CounterId, RuleSnapshot, RuleStore};
use crate::tuple::{ConnKey, FiveTuple, IPPROTO_TCP};
use crate::version::VersionClock;

pub(crate) fn artifact() -> MergedArtifact {
    MergedArtifact {
        matches: MatchSpec::default(),
        tuple: TupleMatch {
            tuple: FiveTuple::new(1, 2, 3, 4, IPPROTO_TCP),
            on_inner: false,
        },
        actions: ActionFlags::FWD_DEST,
        rewrites: Vec::new(),
        dests: Vec::new(),
        split_count: 0,
        tunnel: None,
        counters: Vec::new(),
    }
}

pub(crate) fn binding(id: u64) -> HwBinding {
    HwBinding {
        primary: HwHandle(id),
        peer: None,
    }
}

/// Tracker knowing a fixed set of connections
#[derive(Default)]
pub(crate) struct MockTracker {
    conns: Mutex<HashMap<ConnKey, TrackedConn>>,
    next_id: AtomicU64,
    acquired: AtomicUsize,
    released: Mutex<Vec<(u64, bool)>>,
}

impl MockTracker {
    pub(crate) fn add(&self, original: ConnKey) -> TrackedConn {
        let conn = TrackedConn {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            original,
            reply: original.reverse(),
        };
        let mut conns = self.conns.lock();
        conns.insert(conn.original, conn);
        conns.insert(conn.reply, conn);
        conn
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    pub(crate) fn released(&self) -> Vec<(u64, bool)> {
        self.released.lock().clone()
    }
}

impl ConnTracker for MockTracker {
    fn acquire(&self, key: &ConnKey) -> Option<TrackedConn> {
        let conn = self.conns.lock().get(key).copied()?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(conn)
    }

    fn release(&self, conn: &TrackedConn, destroy: bool) {
        self.released.lock().push((conn.id, destroy));
    }
}

/// Rule store stamping versions from a shared clock
pub(crate) struct MockRules {
    rules: RwLock<HashMap<RuleId, RuleSnapshot>>,
    clock: Arc<VersionClock>,
}

impl MockRules {
    pub(crate) fn new(clock: Arc<VersionClock>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Insert or replace a rule, stamping a fresh version
    pub(crate) fn put(&self, mut rule: RuleSnapshot) -> RuleSnapshot {
        rule.version = self.clock.bump();
        self.rules.write().insert(rule.id, rule.clone());
        rule
    }

    /// Re-stamp a rule as modified
    pub(crate) fn touch(&self, id: RuleId) -> Option<u64> {
        let version = self.clock.bump();
        let mut rules = self.rules.write();
        let rule = rules.get_mut(&id)?;
        rule.version = version;
        Some(version)
    }

    pub(crate) fn remove(&self, id: RuleId) -> Option<RuleSnapshot> {
        self.rules.write().remove(&id)
    }
}

impl RuleStore for MockRules {
    fn lookup(&self, id: RuleId) -> Option<RuleSnapshot> {
        self.rules.read().get(&id).cloned()
    }
}

type InstallHook = Box<dyn Fn(InstallTarget) + Send + Sync>;

/// Installer recording every call
#[derive(Default)]
pub(crate) struct MockInstaller {
    next: AtomicU64,
    pub(crate) installed: Mutex<HashMap<HwHandle, (InstallTarget, MergedArtifact)>>,
    pub(crate) installs: AtomicUsize,
    pub(crate) uninstalls: AtomicUsize,
    pub(crate) links: Mutex<HashMap<HwHandle, Vec<CounterId>>>,
    pub(crate) last_use: Mutex<HashMap<HwHandle, Instant>>,
    pub(crate) fail_primary: AtomicBool,
    pub(crate) fail_peer: AtomicBool,
    pub(crate) fail_uninstall: AtomicBool,
    pub(crate) peer: AtomicBool,
    rejected: Mutex<HashSet<InstallTarget>>,
    on_install: Mutex<Option<InstallHook>>,
}

impl MockInstaller {
    pub(crate) fn set_hook(&self, hook: impl Fn(InstallTarget) + Send + Sync + 'static) {
        *self.on_install.lock() = Some(Box::new(hook));
    }

    pub(crate) fn live(&self) -> usize {
        self.installed.lock().len()
    }

    pub(crate) fn uninstall_count(&self) -> usize {
        self.uninstalls.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self, handle: HwHandle, at: Instant) {
        self.last_use.lock().insert(handle, at);
    }

    pub(crate) fn rejected(&self, target: InstallTarget) -> bool {
        self.rejected.lock().contains(&target)
    }
}

impl FlowInstaller for MockInstaller {
    fn install(&self, artifact: &MergedArtifact, target: InstallTarget) -> Result<HwHandle, HwError> {
        if let Some(hook) = self.on_install.lock().as_ref() {
            hook(target);
        }
        let fail = match target {
            InstallTarget::Primary => &self.fail_primary,
            InstallTarget::Peer => &self.fail_peer,
        };
        if fail.load(Ordering::SeqCst) {
            self.rejected.lock().insert(target);
            return Err(HwError::Rejected(format!("{target:?} table full")));
        }
        let handle = HwHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.installed.lock().insert(handle, (target, artifact.clone()));
        Ok(handle)
    }

    fn uninstall(&self, handle: HwHandle) -> Result<(), HwError> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        self.installed.lock().remove(&handle);
        if self.fail_uninstall.load(Ordering::SeqCst) {
            return Err(HwError::UnknownHandle(handle.0));
        }
        Ok(())
    }

    fn needs_peer(&self, _artifact: &MergedArtifact) -> bool {
        self.peer.load(Ordering::SeqCst)
    }

    fn link_counters(&self, handle: HwHandle, counters: &[CounterId]) {
        self.links.lock().insert(handle, counters.to_vec());
    }

    fn unlink_counters(&self, handle: HwHandle) {
        self.links.lock().remove(&handle);
    }

    fn last_use(&self, handle: HwHandle) -> Option<Instant> {
        self.last_use.lock().get(&handle).copied()
    }
}

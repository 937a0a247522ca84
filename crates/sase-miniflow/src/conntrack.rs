//! Connection tuple table
//!
//! Tracks the connections merged flows depend on, so that an idle or
//! destroyed connection takes its merged flows down with it.
//!
//! # Design
//!
//! - One entry per tracked connection, indexed under both the original and
//!   the reply tuple.
//! - Entries are created lazily on the first merge that references them.
//! - A table-wide lock covers insert and age-out only; dependents are
//!   guarded by a per-entry lock.
//! - Activity comes from hardware last-use of the dependent merged flows.
//! - The tracked connection is released back to the tracker when the last
//!   reference to the entry drops.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::FlowHandle;
use crate::error::ConnError;
use crate::tuple::ConnKey;

/// Connection as reported by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedConn {
    /// Tracker-side identifier
    pub id: u64,
    /// Original direction
    pub original: ConnKey,
    /// Reply direction
    pub reply: ConnKey,
}

/// Connection tracking collaborator
pub trait ConnTracker: Send + Sync {
    /// Find a connection by either direction and take a reference on it
    fn acquire(&self, key: &ConnKey) -> Option<TrackedConn>;

    /// Drop the reference taken by `acquire`
    ///
    /// `destroy` is set when the tracker reported the connection dying; the
    /// tracker should then delete it. Otherwise the connection returns to
    /// software handling with its normal timeouts.
    fn release(&self, conn: &TrackedConn, destroy: bool);
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Active = 0,
    Dying = 1,
}

/// Shared logical connection
pub struct ConnEntry {
    conn: TrackedConn,
    state: AtomicU8,
    destroy_on_free: AtomicBool,
    deps: Mutex<Vec<FlowHandle>>,
    last_active: Mutex<Instant>,
    tracker: Arc<dyn ConnTracker>,
}

impl std::fmt::Debug for ConnEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnEntry")
            .field("conn", &self.conn)
            .field("dying", &self.is_dying())
            .field("deps", &self.deps.lock().len())
            .finish()
    }
}

impl ConnEntry {
    fn new(conn: TrackedConn, tracker: Arc<dyn ConnTracker>, now: Instant) -> Self {
        Self {
            conn,
            state: AtomicU8::new(EntryState::Active as u8),
            destroy_on_free: AtomicBool::new(false),
            deps: Mutex::new(Vec::new()),
            last_active: Mutex::new(now),
            tracker,
        }
    }

    /// Tracker-side connection
    pub fn conn(&self) -> &TrackedConn {
        &self.conn
    }

    /// Removed or marked dying; no new dependents
    pub fn is_dying(&self) -> bool {
        self.state.load(Ordering::Acquire) == EntryState::Dying as u8
    }

    fn set_dying(&self) {
        self.state.store(EntryState::Dying as u8, Ordering::Release);
    }

    /// Dependent merged flows
    pub fn dependents(&self) -> Vec<FlowHandle> {
        self.deps.lock().clone()
    }

    /// Most recent activity seen by aging
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }
}

impl Drop for ConnEntry {
    fn drop(&mut self) {
        self.tracker
            .release(&self.conn, self.destroy_on_free.load(Ordering::Acquire));
    }
}

/// Result of one aging pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AgeReport {
    /// Entries removed
    pub expired: usize,
    /// Dependents that must be torn down
    pub released: Vec<FlowHandle>,
}

/// Connection tuple table
pub struct ConnTable {
    entries: DashMap<ConnKey, Arc<ConnEntry>>,
    table_lock: Mutex<()>,
    tracker: Arc<dyn ConnTracker>,
}

impl ConnTable {
    /// Empty table over `tracker`
    pub fn new(tracker: Arc<dyn ConnTracker>) -> Self {
        Self {
            entries: DashMap::new(),
            table_lock: Mutex::new(()),
            tracker,
        }
    }

    fn get(&self, key: &ConnKey) -> Option<Arc<ConnEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Entry for `key`, if present
    pub fn lookup(&self, key: &ConnKey) -> Option<Arc<ConnEntry>> {
        self.get(key)
    }

    /// Shared entry for `key`, created from the tracker on first use
    pub fn lookup_or_create(&self, key: &ConnKey) -> Result<Arc<ConnEntry>, ConnError> {
        if let Some(entry) = self.get(key) {
            return Self::live(entry);
        }

        let conn = self.tracker.acquire(key).ok_or(ConnError::NotFound)?;
        let fresh = Arc::new(ConnEntry::new(conn, Arc::clone(&self.tracker), Instant::now()));

        let _guard = self.table_lock.lock();
        let winner = self
            .get(key)
            .or_else(|| self.get(&conn.original))
            .or_else(|| self.get(&conn.reply));
        if let Some(existing) = winner {
            // Lost the race; dropping `fresh` releases its tracker reference.
            return Self::live(existing);
        }

        self.entries.insert(conn.original, Arc::clone(&fresh));
        self.entries.insert(conn.reply, Arc::clone(&fresh));
        tracing::trace!("offloaded connection {} ({:?})", conn.id, conn.original);
        Ok(fresh)
    }

    fn live(entry: Arc<ConnEntry>) -> Result<Arc<ConnEntry>, ConnError> {
        if entry.is_dying() {
            Err(ConnError::Dying)
        } else {
            Ok(entry)
        }
    }

    /// Record `flow` as depending on `entry`
    pub fn register_dependent(&self, entry: &ConnEntry, flow: FlowHandle) -> Result<(), ConnError> {
        let mut deps = entry.deps.lock();
        if entry.is_dying() {
            return Err(ConnError::Dying);
        }
        deps.push(flow);
        *entry.last_active.lock() = Instant::now();
        Ok(())
    }

    /// Forget `flow` on `entry`
    pub fn unregister_dependent(&self, entry: &ConnEntry, flow: FlowHandle) {
        entry.deps.lock().retain(|h| *h != flow);
    }

    /// Tracker reports the connection destroyed; the next pass removes it
    pub fn mark_dying(&self, key: &ConnKey) -> bool {
        match self.get(key) {
            Some(entry) => {
                entry.destroy_on_free.store(true, Ordering::Release);
                entry.set_dying();
                true
            }
            None => false,
        }
    }

    /// One aging pass at time `now`
    ///
    /// `last_use` maps a dependent to its most recent hardware hit.
    pub fn age_step(
        &self,
        now: Instant,
        idle_timeout: Duration,
        last_use: impl Fn(FlowHandle) -> Option<Instant>,
    ) -> AgeReport {
        let mut report = AgeReport::default();

        for entry in self.unique_entries() {
            let latest = entry.dependents().into_iter().filter_map(&last_use).max();
            let last_active = {
                let mut last_active = entry.last_active.lock();
                if let Some(seen) = latest {
                    if seen > *last_active {
                        *last_active = seen;
                    }
                }
                *last_active
            };

            let idle = now.saturating_duration_since(last_active) > idle_timeout;
            if idle || entry.is_dying() {
                report.released.extend(self.remove_entry(&entry));
                report.expired += 1;
            }
        }

        if report.expired > 0 {
            tracing::debug!(
                "aged out {} connections, releasing {} merged flows",
                report.expired,
                report.released.len()
            );
        }
        report
    }

    /// Remove every entry regardless of activity
    pub fn drain(&self) -> AgeReport {
        let mut report = AgeReport::default();
        for entry in self.unique_entries() {
            report.released.extend(self.remove_entry(&entry));
            report.expired += 1;
        }
        report
    }

    fn unique_entries(&self) -> Vec<Arc<ConnEntry>> {
        self.entries
            .iter()
            .filter(|e| *e.key() == e.value().conn.original)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn remove_entry(&self, entry: &Arc<ConnEntry>) -> Vec<FlowHandle> {
        {
            let _guard = self.table_lock.lock();
            self.entries
                .remove_if(&entry.conn.original, |_, e| Arc::ptr_eq(e, entry));
            self.entries
                .remove_if(&entry.conn.reply, |_, e| Arc::ptr_eq(e, entry));
        }
        entry.set_dying();
        std::mem::take(&mut *entry.deps.lock())
    }

    /// Live entries (each counted once)
    pub fn len(&self) -> usize {
        self.offloaded_count()
    }

    /// Connections currently offloaded
    pub fn offloaded_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| *e.key() == e.value().conn.original)
            .count()
    }

    /// No live entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTracker;
    use crate::tuple::{FiveTuple, Zone, IPPROTO_TCP};
    use std::sync::Barrier;
    use std::thread;

    const IDLE: Duration = Duration::from_secs(30);

    fn key(port: u16) -> ConnKey {
        ConnKey::new(FiveTuple::new(0x0a000001, 0x0a000002, port, 443, IPPROTO_TCP), Zone(1))
    }

    fn table() -> (ConnTable, Arc<MockTracker>) {
        let tracker = Arc::new(MockTracker::default());
        (ConnTable::new(tracker.clone()), tracker)
    }

    #[test]
    fn test_lookup_or_create_not_found() {
        let (table, _) = table();
        assert_eq!(table.lookup_or_create(&key(1)).unwrap_err(), ConnError::NotFound);
        assert!(table.is_empty());
    }

    #[test]
    fn test_both_directions_share_entry() {
        let (table, tracker) = table();
        tracker.add(key(1));
        let a = table.lookup_or_create(&key(1)).unwrap();
        let b = table.lookup_or_create(&key(1).reverse()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert_eq!(tracker.acquired(), 1);
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let (table, tracker) = table();
        tracker.add(key(7));
        let table = Arc::new(table);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    table.lookup_or_create(&key(7)).unwrap()
                })
            })
            .collect();
        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(table.len(), 1);
        // Every losing creator released what it acquired.
        assert_eq!(tracker.acquired() - tracker.released().len(), 1);
    }

    #[test]
    fn test_register_refused_when_dying() {
        let (table, tracker) = table();
        tracker.add(key(2));
        let entry = table.lookup_or_create(&key(2)).unwrap();
        table.register_dependent(&entry, FlowHandle(1)).unwrap();

        assert!(table.mark_dying(&key(2)));
        assert_eq!(table.register_dependent(&entry, FlowHandle(2)), Err(ConnError::Dying));
        assert_eq!(table.lookup_or_create(&key(2)).unwrap_err(), ConnError::Dying);
        assert_eq!(entry.dependents(), vec![FlowHandle(1)]);
    }

    #[test]
    fn test_unregister() {
        let (table, tracker) = table();
        tracker.add(key(3));
        let entry = table.lookup_or_create(&key(3)).unwrap();
        table.register_dependent(&entry, FlowHandle(1)).unwrap();
        table.register_dependent(&entry, FlowHandle(2)).unwrap();
        table.unregister_dependent(&entry, FlowHandle(1));
        assert_eq!(entry.dependents(), vec![FlowHandle(2)]);
    }

    #[test]
    fn test_age_step_keeps_active_entries() {
        let (table, tracker) = table();
        tracker.add(key(4));
        let entry = table.lookup_or_create(&key(4)).unwrap();
        table.register_dependent(&entry, FlowHandle(9)).unwrap();

        let now = Instant::now();
        let hit = now + Duration::from_secs(25);
        let report = table.age_step(now + Duration::from_secs(40), IDLE, |_| Some(hit));
        assert_eq!(report.expired, 0);
        assert_eq!(entry.last_active(), hit);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_age_step_expires_idle_entries() {
        let (table, tracker) = table();
        tracker.add(key(5));
        let entry = table.lookup_or_create(&key(5)).unwrap();
        table.register_dependent(&entry, FlowHandle(1)).unwrap();
        table.register_dependent(&entry, FlowHandle(2)).unwrap();
        drop(entry);

        let later = Instant::now() + IDLE + Duration::from_secs(1);
        let report = table.age_step(later, IDLE, |_| None);
        assert_eq!(report.expired, 1);
        assert_eq!(report.released, vec![FlowHandle(1), FlowHandle(2)]);
        assert!(table.is_empty());
        assert_eq!(tracker.released(), vec![(1, false)]);
    }

    #[test]
    fn test_dying_entry_removed_and_destroyed() {
        let (table, tracker) = table();
        tracker.add(key(6));
        let entry = table.lookup_or_create(&key(6)).unwrap();
        table.mark_dying(&key(6));

        let report = table.age_step(Instant::now(), IDLE, |_| None);
        assert_eq!(report.expired, 1);
        assert!(table.is_empty());
        // Still referenced here, so not yet released.
        assert!(tracker.released().is_empty());
        drop(entry);
        assert_eq!(tracker.released(), vec![(1, true)]);
    }

    #[test]
    fn test_drain() {
        let (table, tracker) = table();
        tracker.add(key(10));
        tracker.add(key(11));
        table.lookup_or_create(&key(10)).unwrap();
        table.lookup_or_create(&key(11)).unwrap();
        let report = table.drain();
        assert_eq!(report.expired, 2);
        assert!(table.is_empty());
        assert_eq!(tracker.released().len(), 2);
    }
}

//! A single change group: members, snapshot and poll statistics

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use crate::detector::Snapshot;

/// Members in insertion order with O(1) membership checks
#[derive(Debug, Default)]
pub struct MemberList {
    ordered: Vec<String>,
    index: HashSet<String>,
}

impl MemberList {
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains(name)
    }

    /// Returns false when already present
    pub fn insert(&mut self, name: String) -> bool {
        if !self.index.insert(name.clone()) {
            return false;
        }
        self.ordered.push(name);
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if !self.index.remove(name) {
            return false;
        }
        self.ordered.retain(|n| n != name);
        true
    }

    /// Remove everything, returning how many members there were
    pub fn clear(&mut self) -> usize {
        let count = self.ordered.len();
        self.ordered.clear();
        self.index.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.ordered.clone()
    }
}

/// A named set of monitored controls
///
/// The snapshot sits behind an async mutex that is held for the whole of a
/// poll, gateway round trip included. That lock is what serializes polls
/// within a group; admin operations that touch the snapshot take it too.
#[derive(Debug)]
pub struct ChangeGroup {
    id: String,
    members: RwLock<MemberList>,
    snapshot: Mutex<Snapshot>,
    destroyed: AtomicBool,
    poll_count: AtomicU64,
    last_poll_ms: AtomicU64,
}

impl ChangeGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(MemberList::default()),
            snapshot: Mutex::new(Snapshot::new()),
            destroyed: AtomicBool::new(false),
            poll_count: AtomicU64::new(0),
            last_poll_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &RwLock<MemberList> {
        &self.members
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.read().to_vec()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Wait for the snapshot (and any in-flight poll)
    pub async fn lock_snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().await
    }

    /// Take the snapshot only if no poll is in flight
    pub fn try_lock_snapshot(&self) -> Option<MutexGuard<'_, Snapshot>> {
        self.snapshot.try_lock().ok()
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn record_poll(&self, now_ms: u64) {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
        self.last_poll_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn poll_count(&self) -> u64 {
        self.poll_count.load(Ordering::Relaxed)
    }

    pub fn last_poll_ms(&self) -> Option<u64> {
        match self.last_poll_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_list_preserves_insertion_order() {
        let mut members = MemberList::default();
        assert!(members.insert("B.mute".into()));
        assert!(members.insert("A.gain".into()));
        assert!(!members.insert("B.mute".into()));
        assert_eq!(members.to_vec(), vec!["B.mute", "A.gain"]);

        assert!(members.remove("B.mute"));
        assert!(!members.remove("B.mute"));
        assert_eq!(members.to_vec(), vec!["A.gain"]);
        assert_eq!(members.clear(), 1);
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_lock_excludes_second_poll() {
        let group = ChangeGroup::new("g1");
        let guard = group.lock_snapshot().await;
        assert!(group.try_lock_snapshot().is_none());
        drop(guard);
        assert!(group.try_lock_snapshot().is_some());
    }

    #[test]
    fn test_poll_stats() {
        let group = ChangeGroup::new("g1");
        assert_eq!(group.last_poll_ms(), None);
        group.record_poll(1_700_000_000_000);
        group.record_poll(1_700_000_000_500);
        assert_eq!(group.poll_count(), 2);
        assert_eq!(group.last_poll_ms(), Some(1_700_000_000_500));
    }
}

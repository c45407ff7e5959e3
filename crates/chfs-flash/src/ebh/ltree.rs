//! Per-LEB lock tree
//!
//! Holds one reader/writer lock per LEB that somebody is currently using.
//! An entry is created on first use and removed when its last user drops
//! its guard, so the tree only ever contains contended or active LEBs.

use chfs_common::Lnr;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

struct Entry {
    lock: Arc<RwLock<()>>,
    users: usize,
}

/// Reference-counted map of LEB locks
#[derive(Default)]
pub struct LockTree {
    entries: Mutex<HashMap<Lnr, Entry>>,
}

impl LockTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, lnr: Lnr) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(lnr).or_insert_with(|| Entry {
            lock: Arc::new(RwLock::new(())),
            users: 0,
        });
        entry.users += 1;
        Arc::clone(&entry.lock)
    }

    fn release(&self, lnr: Lnr) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&lnr) {
            entry.users -= 1;
            if entry.users == 0 {
                entries.remove(&lnr);
            }
        }
    }

    /// Take the LEB lock shared
    pub fn read(&self, lnr: Lnr) -> LebReadGuard<'_> {
        let lock = self.acquire(lnr);
        let guard = lock.read_arc();
        LebReadGuard {
            tree: self,
            lnr,
            guard: Some(guard),
        }
    }

    /// Take the LEB lock exclusive
    pub fn write(&self, lnr: Lnr) -> LebWriteGuard<'_> {
        let lock = self.acquire(lnr);
        let guard = lock.write_arc();
        LebWriteGuard {
            tree: self,
            lnr,
            guard: Some(guard),
        }
    }

    /// Number of LEBs with live lock entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared hold on one LEB
pub struct LebReadGuard<'a> {
    tree: &'a LockTree,
    lnr: Lnr,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

impl Drop for LebReadGuard<'_> {
    fn drop(&mut self) {
        // unlock before the entry can be removed
        self.guard.take();
        self.tree.release(self.lnr);
    }
}

/// Exclusive hold on one LEB
pub struct LebWriteGuard<'a> {
    tree: &'a LockTree,
    lnr: Lnr,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl Drop for LebWriteGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.tree.release(self.lnr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_entries_are_reclaimed() {
        let tree = LockTree::new();
        {
            let _a = tree.read(Lnr::new(1));
            let _b = tree.read(Lnr::new(1));
            let _c = tree.write(Lnr::new(2));
            assert_eq!(tree.len(), 2);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_writer_excludes_reader() {
        let tree = Arc::new(LockTree::new());
        let entered = Arc::new(AtomicBool::new(false));

        let w = tree.write(Lnr::new(7));
        let handle = {
            let tree = Arc::clone(&tree);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _r = tree.read(Lnr::new(7));
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(w);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_distinct_lebs_do_not_contend() {
        let tree = LockTree::new();
        let _a = tree.write(Lnr::new(1));
        let _b = tree.write(Lnr::new(2));
        assert_eq!(tree.len(), 2);
    }
}

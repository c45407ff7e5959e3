//! Ordered locks
//!
//! The mount-wide locks must always be taken in the same order:
//!
//! 1. mount state (block queues, open block, GC cursor)
//! 2. vnode table (vnode caches, node reference arena)
//! 3. sizes (the space ledger)
//! 4. write buffer
//!
//! Each wrapper records the levels the current thread holds and panics
//! when a lock is taken while a lock of the same or a deeper level is
//! already held. Per-LEB locks in the eraseblock handler sit outside this
//! scheme.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};

/// Position of a lock in the nesting order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    Mount = 1,
    Vnodes = 2,
    Sizes = 3,
    Wbuf = 4,
}

impl LockLevel {
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

fn enter(level: LockLevel) {
    HELD.with(|held| {
        let current = held.get();
        // bits of this level and every deeper one
        let forbidden = !(level.bit() - 1);
        assert!(
            current & forbidden == 0,
            "lock order violation: taking {level:?} while holding {current:#07b}"
        );
        held.set(current | level.bit());
    });
}

fn leave(level: LockLevel) {
    HELD.with(|held| held.set(held.get() & !level.bit()));
}

/// Levels held by the current thread, as a bit set
#[cfg(test)]
pub(crate) fn held_levels() -> u8 {
    HELD.with(Cell::get)
}

/// Mutex that checks the nesting order
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        enter(self.level);
        OrderedGuard {
            level: self.level,
            guard: self.inner.lock(),
        }
    }
}

pub struct OrderedGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        leave(self.level);
    }
}

/// Reader/writer lock that checks the nesting order
pub struct OrderedRwLock<T> {
    level: LockLevel,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> OrderedReadGuard<'_, T> {
        enter(self.level);
        OrderedReadGuard {
            level: self.level,
            guard: self.inner.read(),
        }
    }

    pub fn write(&self) -> OrderedWriteGuard<'_, T> {
        enter(self.level);
        OrderedWriteGuard {
            level: self.level,
            guard: self.inner.write(),
        }
    }
}

pub struct OrderedReadGuard<'a, T> {
    level: LockLevel,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for OrderedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for OrderedReadGuard<'_, T> {
    fn drop(&mut self) {
        leave(self.level);
    }
}

pub struct OrderedWriteGuard<'a, T> {
    level: LockLevel,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for OrderedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedWriteGuard<'_, T> {
    fn drop(&mut self) {
        leave(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_nesting() {
        let mount = OrderedMutex::new(LockLevel::Mount, 1);
        let sizes = OrderedMutex::new(LockLevel::Sizes, 2);
        let wbuf = OrderedRwLock::new(LockLevel::Wbuf, 3);

        {
            let _m = mount.lock();
            let _s = sizes.lock();
            let _w = wbuf.read();
            assert_eq!(held_levels().count_ones(), 3);
        }
        assert_eq!(held_levels(), 0);

        // skipping levels is fine
        let _w = wbuf.write();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_reverse_order_panics() {
        let mount = OrderedMutex::new(LockLevel::Mount, ());
        let sizes = OrderedMutex::new(LockLevel::Sizes, ());
        let _s = sizes.lock();
        let _m = mount.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_recursive_lock_panics() {
        let vnodes = OrderedMutex::new(LockLevel::Vnodes, ());
        let _a = vnodes.lock();
        let _b = vnodes.lock();
    }
}

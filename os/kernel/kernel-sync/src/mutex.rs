use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A value guarded by a raw lock `R`.
///
/// Every allocator component lives in one of these; a guard is held for the
/// full duration of each public operation.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
}

// SAFETY: access to `cell` is serialized by `raw`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
        }
    }
}

/// Holds the lock of a [`Mutex`] until dropped.
pub struct MutexGuard<'a, T, R: RawUnlock> {
    mutex: &'a Mutex<T, R>,
}

impl<T, R: RawUnlock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &*self.mutex.cell.get() }
    }
}

impl<T, R: RawUnlock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.mutex.cell.get() }
    }
}

impl<T, R: RawUnlock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: a guard only exists while its lock is held.
        unsafe { self.mutex.raw.raw_unlock() }
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { mutex: self }
    }

    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw.raw_try_lock().then(|| MutexGuard { mutex: self })
    }

    /// Runs `f` with the lock held and releases it afterwards, also on unwind.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut guard)
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_is_locked()
    }
}

//! # Kernel synchronization primitives
//!
//! The memory manager has no scheduler to lean on; exclusion comes from
//! spinning on an atomic flag and, around paging switches, from masking
//! interrupts. [`SpinMutex`] serializes a component, [`IrqGuard`] saves and
//! restores the interrupt flag, and [`SyncOnceCell`] publishes the kernel's
//! memory context exactly once.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// Only the current holder of the lock may release it.
    unsafe fn raw_unlock(&self);
}

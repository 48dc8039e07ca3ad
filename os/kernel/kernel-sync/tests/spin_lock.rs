use kernel_sync::irq::{disable_interrupts, enable_interrupts, interrupts_enabled};
use kernel_sync::{IrqGuard, SpinMutex, SyncOnceCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let m = SpinMutex::new(0_u32);

    {
        let mut g = m.lock();
        *g = 41;
        assert!(m.is_locked());
    }
    assert!(!m.is_locked());

    let mut g = m.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_semantics() {
    let m = SpinMutex::new(1u8);

    let g1 = m.try_lock();
    assert!(g1.is_some());
    assert!(m.try_lock().is_none());

    drop(g1);
    assert!(m.try_lock().is_some());
}

#[test]
fn with_lock_works_and_unlocks() {
    let m = SpinMutex::new(vec![0x1000_u32]);
    let len = m.with_lock(|frames| {
        frames.push(0x2000);
        frames.len()
    });
    assert_eq!(len, 2);
    assert_eq!(m.with_lock(|frames| frames.clone()), [0x1000, 0x2000]);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let m = SpinMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        m.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(m.with_lock(|v| *v), 123);
}

#[test]
fn once_cell_sets_exactly_once() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(7u32), Ok(()));
    assert!(cell.is_set());
    assert_eq!(cell.set(8u32), Err(8));
    assert_eq!(cell.get(), Some(&7));
}

// The simulated interrupt flag is process-wide, so every check on it lives
// in this one test.
#[test]
fn irq_guard_restores_previous_state() {
    enable_interrupts();
    {
        let g = IrqGuard::new();
        assert!(g.were_enabled());
        assert!(!interrupts_enabled());
        {
            let inner = IrqGuard::new();
            assert!(!inner.were_enabled());
        }
        assert!(!interrupts_enabled(), "inner guard must not re-enable");
    }
    assert!(interrupts_enabled());

    disable_interrupts();
    drop(IrqGuard::new());
    assert!(!interrupts_enabled(), "guard must not enable what was off");
}

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::proc::{self, InterruptLock};

/// Owner value of an unlocked `SpinLock`.
const NO_CPU: usize = usize::MAX;

/// A mutual exclusion primitive useful for protecting shared data.
/// It uses a spinlock to achieve mutual exclusion.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    /// Hart holding the lock, or `NO_CPU`.
    cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

/// A guard that releases the lock when dropped.
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicUsize::new(NO_CPU),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the current CPU is holding the lock.
    /// Must be called with interrupts disabled.
    fn holding_unchecked(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == proc::current_id()
    }

    /// Returns true if the current CPU is holding the lock.
    pub fn holding(&self) -> bool {
        let _intr_lock = proc::lock_current_cpu();
        self.holding_unchecked()
    }

    /// Acquires the mutex, blocking the current thread until it is able to do so.
    ///
    /// Returns a guard that releases the lock when dropped.
    ///
    /// Current thread's interrupts will be disabled while holding the lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let intr_lock = proc::lock_current_cpu();

        assert!(!self.holding_unchecked(), "acquire spinlock {}", self.name);

        let id = proc::current_id();
        loop {
            if self
                .cpu
                .compare_exchange(NO_CPU, id, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break SpinLockGuard {
                    lock: self,
                    _intr_lock: intr_lock,
                };
            }

            hint::spin_loop()
        }
    }

    /// Releases the lock on the mutex.
    ///
    /// Interrupt lock held by the guard will also be released, restoring the previous interrupt
    /// state.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        guard.lock
    }
}

/// Dropping the guard will release the lock on the mutex and also release the interrupt lock.
impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(
            self.lock.holding_unchecked(),
            "release lock {}",
            self.lock.name
        );

        self.lock.cpu.store(NO_CPU, Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

// Safety: a guard hands out `&mut T` to whichever hart holds the lock, so T must be Send.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

// Safety: SpinLock can be sent to another thread if T can be sent.
unsafe impl<T> Send for SpinLock<T> where T: Send {}

// Safety: Since the holder can call `Deref`, if we are sharing a reference, the inner type must
// also be thread safe to Sync.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::thread;

    use super::*;
    use crate::riscv::interrupts;

    #[test]
    fn mutual_exclusion_under_contention() {
        const HARTS: usize = 4;
        const ROUNDS: usize = 5_000;

        let counter = Arc::new(SpinLock::new(0usize, "counter"));
        let inside = Arc::new(AtomicUsize::new(0));

        let harts: Vec<_> = (0..HARTS)
            .map(|_| {
                let counter = counter.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = counter.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *guard += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for hart in harts {
            hart.join().unwrap();
        }

        assert_eq!(*counter.lock(), HARTS * ROUNDS);
    }

    #[test]
    fn holding_is_per_hart() {
        let lock = Arc::new(SpinLock::new((), "held"));
        assert!(!lock.holding());

        let guard = lock.lock();
        assert!(lock.holding());

        let other = lock.clone();
        assert!(!thread::spawn(move || other.holding()).join().unwrap());

        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    fn interrupts_off_while_held() {
        let a = SpinLock::new(1, "a");
        let b = SpinLock::new(2, "b");

        let ga = a.lock();
        assert!(!interrupts::get());
        let gb = b.lock();
        drop(ga);
        assert!(!interrupts::get(), "b is still held");
        assert_eq!(*gb, 2);
        drop(gb);
        assert!(interrupts::get());
    }

    #[test]
    fn unlock_returns_lock_for_reacquire() {
        let lock = SpinLock::new(5, "relock");
        let mut guard = lock.lock();
        *guard += 1;

        let lock_ref = SpinLock::unlock(guard);
        assert!(!lock_ref.holding());
        assert_eq!(*lock_ref.lock(), 6);
    }

    #[test]
    #[should_panic(expected = "acquire spinlock twice")]
    fn reacquire_on_same_hart() {
        let lock = SpinLock::new((), "twice");
        let _first = lock.lock();
        let _second = lock.lock();
    }
}

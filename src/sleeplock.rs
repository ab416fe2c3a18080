use core::cell::UnsafeCell;

use crate::proc::{self, Channel, Pid};
use crate::spinlock::SpinLock;

/// Inner state of a SleepLock.
/// This is guarded by a SpinLock.
#[derive(Debug)]
pub struct SleepLockInner {
    locked: bool,
    pid: Option<Pid>,
}

/// A lock that causes the caller to sleep while waiting.
/// Unlike SpinLock, interrupts remain enabled while holding a SleepLock.
#[derive(Debug)]
pub struct SleepLock<T> {
    /// SpinLock only protects the lock state and not the data
    inner: SpinLock<SleepLockInner>,
    data: UnsafeCell<T>,
}

/// A guard that releases the SleepLock when dropped.
#[derive(Debug)]
pub struct SleepLockGuard<'a, T: 'a> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SleepLock {
            inner: SpinLock::new(
                SleepLockInner {
                    pid: None,
                    locked: false,
                },
                name,
            ),
            data: UnsafeCell::new(value),
        }
    }

    fn channel(&self) -> Channel {
        Channel::Lock(self as *const _ as usize)
    }

    /// Returns true if the current process is holding the lock.
    pub fn holding(&self) -> bool {
        let pid = proc::current_proc().pid();
        let inner = self.inner.lock();

        inner.locked && inner.pid == Some(pid)
    }

    /// Acquires the lock, sleeping until it is available.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let pid = proc::current_proc().pid();
        let mut inner = self.inner.lock();

        while inner.locked {
            inner = proc::sleep(self.channel(), inner);
        }

        inner.locked = true;
        inner.pid = Some(pid);

        SleepLockGuard { lock: self }
    }

    /// Consumes the mutex and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        inner.locked = false;
        inner.pid = None;

        // wake up any waiters before dropping the spinlock
        proc::wakeup(self.lock.channel());
    }
}

impl<T> core::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

// Safety: Since the holder can call `into_inner`, if we are sharing a reference, the inner type
// must also be thread safe to Send.
unsafe impl<T> Sync for SleepLock<T> where T: Send {}

// Safety: SleepLock can be sent to another thread if T can be sent.
unsafe impl<T> Send for SleepLock<T> where T: Send {}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::proc::tests::wait_until_sleeping;
    use crate::riscv::interrupts;

    #[test]
    fn holder_keeps_interrupts_on() {
        let lock = SleepLock::new(0, "sleep");
        let mut guard = lock.lock();
        assert!(interrupts::get());
        assert!(lock.holding());
        *guard = 7;
        drop(guard);

        assert!(!lock.holding());
        assert_eq!(lock.into_inner(), 7);
    }

    #[test]
    fn contender_sleeps_until_release() {
        let lock = Arc::new(SleepLock::new(alloc::vec::Vec::new(), "sleep"));
        let mut guard = lock.lock();

        let contender_lock = lock.clone();
        let contender = proc::spawn("contender", move || {
            let mut guard = contender_lock.lock();
            assert!(contender_lock.holding());
            guard.push("second");
        })
        .unwrap();

        wait_until_sleeping(contender.proc());
        assert!(contender.proc().inner.lock().channel.is_some());

        guard.push("first");
        drop(guard);
        contender.join();

        assert_eq!(*lock.lock(), ["first", "second"]);
    }
}

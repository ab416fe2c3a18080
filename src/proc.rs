use alloc::string::String;
use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::{MaybeUninit, transmute};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, Thread};

use crate::error::KernelError;
use crate::param::NPROC;
use crate::riscv::interrupts;
use crate::spinlock::{SpinLock, SpinLockGuard};

pub static PROC_TABLE: ProcTable = ProcTable::new();

std::thread_local! {
    static CPU: Cpu = Cpu::new();
}

/// Per-CPU state
///
/// Every host thread that enters the kernel is a hart of its own.
pub struct Cpu {
    id: usize,
    proc: Cell<Option<&'static Proc>>,
    /// Depth of `push_off()` nesting.
    num_off: Cell<usize>,
    /// Were interrupts enabled before `push_off()`?
    interrupts_enabled: Cell<bool>,
}

impl Cpu {
    fn new() -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            proc: Cell::new(None),
            num_off: Cell::new(0),
            interrupts_enabled: Cell::new(false),
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&self, old_state: bool) -> InterruptLock {
        if self.num_off.get() == 0 {
            self.interrupts_enabled.set(old_state);
        }
        self.num_off.set(self.num_off.get() + 1);
        InterruptLock::new_unchecked()
    }

    /// Unlocks this CPU by enabling interrupts if appropriate.
    fn unlock(&self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off.get() >= 1, "cpu unlock");

        self.num_off.set(self.num_off.get() - 1);
        if self.num_off.get() == 0 && self.interrupts_enabled.get() {
            interrupts::enable();
        }
    }
}

impl Drop for Cpu {
    fn drop(&mut self) {
        // the thread is exiting; give its process slot back
        if let Some(proc) = self.proc.get() {
            proc.used.store(false, Ordering::Release);
        }
    }
}

/// A lock that releases the CPU lock when dropped.
///
/// Bound to the hart that took it.
#[derive(Debug)]
pub struct InterruptLock {
    _not_send: PhantomData<*mut ()>,
}

impl InterruptLock {
    /// Makes the token for a `push_off` that already happened.
    /// Dropping it performs the matching `pop_off`.
    fn new_unchecked() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for InterruptLock {
    fn drop(&mut self) {
        CPU.with(Cpu::unlock)
    }
}

/// Returns the hart id of the current CPU.
pub fn current_id() -> usize {
    CPU.with(|cpu| cpu.id)
}

/// Depth of interrupt-disable nesting on the current CPU.
pub fn num_off() -> usize {
    CPU.with(|cpu| cpu.num_off.get())
}

/// Locks this CPU by disabling interrupts (`push_off`).
/// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
/// Dropping it is `pop_off`.
pub fn lock_current_cpu() -> InterruptLock {
    let old_state = interrupts::get();
    interrupts::disable();

    CPU.with(|cpu| cpu.lock(old_state))
}

/// Returns this CPU's [`Proc`], if the thread is attached to one.
pub fn current_proc_opt() -> Option<&'static Proc> {
    CPU.with(|cpu| cpu.proc.get())
}

/// Returns this CPU's [`Proc`].
/// A thread that was not started with [`spawn`] is given a process slot on first use.
pub fn current_proc() -> &'static Proc {
    if let Some(proc) = current_proc_opt() {
        return proc;
    }

    let name = thread::current().name().unwrap_or("kthread").into();
    let proc = PROC_TABLE
        .alloc(name)
        .unwrap_or_else(|e| panic!("current_proc: {e}"));
    attach(proc);
    proc
}

fn attach(proc: &'static Proc) {
    CPU.with(|cpu| cpu.proc.set(Some(proc)));

    let mut inner = proc.inner.lock();
    inner.thread = Some(thread::current());
    inner.state = ProcState::Running;
}

/// Wrapper around usize to represent process IDs.
/// It must be created using `Pid::alloc()` to ensure uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

impl Pid {
    /// Allocates a new PID by incrementing a global counter.
    pub fn alloc() -> Self {
        static PID_COUNT: AtomicUsize = AtomicUsize::new(1);
        Pid(PID_COUNT.fetch_add(1, Ordering::Relaxed))
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Channel type for `sleep`/`wakeup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Address of a `SleepLock`.
    Lock(usize),
    /// Disk request id.
    Disk(usize),
    /// Any other address-sized identifier.
    Addr(usize),
}

/// The state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Runnable,
    Running,
    Sleeping,
}

/// Process control block
#[derive(Debug)]
pub struct Proc {
    /// NOT `Pid`. Used for indexing in `PROC_TABLE`.
    pub id: usize,
    used: AtomicBool,
    pub inner: SpinLock<ProcInner>,
}

/// Process lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct ProcInner {
    /// Process state
    pub state: ProcState,
    /// If Some, sleeping on chan
    pub channel: Option<Channel>,
    /// Process ID
    pub pid: Pid,
    /// Process name
    pub name: String,
    /// Host thread running this process, resumed by `wakeup()`
    thread: Option<Thread>,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            channel: None,
            pid: Pid(0),
            name: String::new(),
            thread: None,
        }
    }
}

impl Proc {
    const fn new(id: usize) -> Self {
        Self {
            id,
            used: AtomicBool::new(false),
            inner: SpinLock::new(ProcInner::new(), "proc"),
        }
    }

    pub fn pid(&self) -> Pid {
        self.inner.lock().pid
    }

    pub fn state(&self) -> ProcState {
        self.inner.lock().state
    }
}

/// Table of processes
pub struct ProcTable([Proc; NPROC]);

impl ProcTable {
    const fn new() -> Self {
        let mut array: [MaybeUninit<Proc>; NPROC] = unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NPROC {
            array[i] = MaybeUninit::new(Proc::new(i));
            i += 1;
        }
        unsafe { transmute(array) }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        self.0.iter()
    }

    /// Looks for an unused slot and claims it for a new process.
    pub fn alloc(&self, name: String) -> Result<&Proc, KernelError> {
        for proc in self.iter() {
            if proc
                .used
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let mut inner = proc.inner.lock();
                inner.state = ProcState::Runnable;
                inner.channel = None;
                inner.pid = Pid::alloc();
                inner.name = name;
                inner.thread = None;
                return Ok(proc);
            }
        }

        err!(KernelError::OutOfProc)
    }
}

/// A kernel thread started with [`spawn`].
#[derive(Debug)]
pub struct KThread<T> {
    proc: &'static Proc,
    handle: JoinHandle<T>,
}

impl<T> KThread<T> {
    pub fn proc(&self) -> &'static Proc {
        self.proc
    }

    /// Waits for the thread to finish, propagating its panic.
    pub fn join(self) -> T {
        match self.handle.join() {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Starts a kernel thread in a fresh process slot.
pub fn spawn<F, T>(name: &str, f: F) -> Result<KThread<T>, KernelError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let proc = PROC_TABLE.alloc(name.into())?;

    let handle = thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            attach(proc);
            f()
        });

    match handle {
        Ok(handle) => Ok(KThread { proc, handle }),
        Err(_) => {
            proc.used.store(false, Ordering::Release);
            err!(KernelError::Spawn)
        }
    }
}

/// Gives up the CPU until the process is no longer sleeping.
/// Must hold only the proc lock.
fn sched(mut inner: SpinLockGuard<'_, ProcInner>) -> SpinLockGuard<'_, ProcInner> {
    assert_eq!(num_off(), 1, "sched locks");
    assert!(!interrupts::get(), "sched interruptible");

    while inner.state == ProcState::Sleeping {
        let lock = SpinLock::unlock(inner);
        thread::park();
        inner = lock.lock();
    }

    inner.state = ProcState::Running;
    inner
}

/// Atomically releases a condition's lock and sleeps on channel.
/// Reacquires the lock when awakened.
pub fn sleep<T>(channel: Channel, condition_lock: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    // To make sure the condition is not resolved before we sleep, we acquire proc's lock before
    // unlocking the condition's lock. `wakeup()` must also acquire proc's lock to resolve the
    // condition, which it cannot do before we release it.
    let proc = current_proc();
    let condition_mutex;
    {
        let mut inner = proc.inner.lock();

        condition_mutex = SpinLock::unlock(condition_lock);

        // go to sleep.
        inner.channel = Some(channel);
        inner.state = ProcState::Sleeping;

        inner = sched(inner);

        inner.channel = None;
    } // drop inner lock

    // reacquire original lock.
    condition_mutex.lock()
}

/// Wakes up all processes sleeping on channel.
/// Must be called without any proc lock.
pub fn wakeup(channel: Channel) {
    for proc in PROC_TABLE.iter() {
        // the caller's own proc is running, not sleeping
        if proc.inner.holding() {
            continue;
        }

        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Sleeping && inner.channel == Some(channel) {
            inner.state = ProcState::Runnable;
            if let Some(thread) = &inner.thread {
                thread.unpark();
            }
        }
    }
}

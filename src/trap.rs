//! Interrupt delivery.
//!
//! A device raises an interrupt on the hart it runs on. If that hart is interruptible the
//! handler runs right away as a nested trap with interrupts off; otherwise it is held pending
//! until the hart turns interrupts back on, which for kernel code means until the outermost
//! spinlock is released. A handler therefore never runs on a hart that holds a spinlock, so it
//! can take any lock ordinary threads take.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::cell::RefCell;

use crate::riscv::interrupts;

type Handler = Box<dyn FnOnce()>;

std::thread_local! {
    static PENDING: RefCell<VecDeque<Handler>> = const { RefCell::new(VecDeque::new()) };
}

/// Raises an interrupt on the current hart.
pub fn interrupt<F>(handler: F)
where
    F: FnOnce() + 'static,
{
    PENDING.with(|pending| pending.borrow_mut().push_back(Box::new(handler)));

    if interrupts::get() {
        deliver_pending();
    }
}

/// Number of interrupts waiting for this hart to become interruptible.
pub fn pending() -> usize {
    PENDING.with(|pending| pending.borrow().len())
}

/// Takes pending interrupts while the hart is interruptible.
pub(crate) fn deliver_pending() {
    while interrupts::get() {
        let Some(handler) = PENDING.with(|pending| pending.borrow_mut().pop_front()) else {
            break;
        };

        kerneltrap(handler);
    }
}

// interrupts from kernel code go here, on whatever the current kernel stack is
fn kerneltrap(handler: Handler) {
    interrupts::write(false);
    let depth = crate::proc::num_off();

    handler();

    assert!(!interrupts::get(), "kerneltrap: interrupts enabled");
    assert_eq!(crate::proc::num_off(), depth, "kerneltrap: unbalanced locks");

    interrupts::write(true);
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::sync::Arc;
    use core::cell::Cell;

    use super::*;
    use crate::spinlock::SpinLock;

    #[test]
    fn runs_immediately_when_interruptible() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        interrupt(move || {
            assert!(!interrupts::get());
            flag.set(true);
        });

        assert!(ran.get());
        assert!(interrupts::get());
        assert_eq!(pending(), 0);
    }

    #[test]
    fn deferred_while_lock_held() {
        let lock = Arc::new(SpinLock::new(0, "intr"));
        let handler_lock = lock.clone();

        let mut guard = lock.lock();
        interrupt(move || *handler_lock.lock() += 1);

        // the handler would deadlock on `lock` if it ran now
        assert_eq!(pending(), 1);
        *guard += 10;
        drop(guard);

        assert_eq!(pending(), 0);
        assert_eq!(*lock.lock(), 11);
    }

    #[test]
    fn nested_raise_is_queued_behind_current_handler() {
        let order = Rc::new(RefCell::new(alloc::vec::Vec::new()));
        let outer = order.clone();

        interrupt(move || {
            let inner = outer.clone();
            interrupt(move || inner.borrow_mut().push(2));
            outer.borrow_mut().push(1);
        });

        assert_eq!(*order.borrow(), [1, 2]);
    }
}

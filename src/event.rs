// Waitable condition for task-to-task signaling
//
// wait() parks the caller in the event's FIFO waiter set; signal_one()
// releases the oldest waiter, signal_all() broadcasts. Signals do not
// latch — with no waiters a signal is lost. Interrupt-driven
// conditions use the latched ExternalSignal bridge instead; this type
// is only ever touched from task context.

use alloc::rc::Weak;
use core::cell::RefCell;

use crate::kernel::{Core, EventWait};

/// A condition tasks can block on. Created through
/// [`Runtime::event`](crate::Runtime::event); clones refer to the same
/// waiter set.
#[derive(Clone)]
pub struct Event {
    pub(crate) core: Weak<RefCell<Core>>,
    pub(crate) id: u64,
}

impl Event {
    /// Suspend the calling task until the event is signaled.
    /// Resolves to `Err(Cancelled)` if the caller is cancelled first.
    pub fn wait(&self) -> EventWait {
        EventWait::new(self.core.clone(), self.id)
    }

    /// Wake the oldest waiter, if any.
    pub fn signal_one(&self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().signal_event(self.id, false);
        }
    }

    /// Wake every current waiter.
    pub fn signal_all(&self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().signal_event(self.id, true);
        }
    }
}

// Task waker for foreign futures
//
// Kernel primitives (sleep, event wait, join) register their wake
// conditions in kernel state directly and never touch the waker; it
// exists so arbitrary futures composed into a task can still
// reschedule it. Single-threaded by construction: wakers must stay on
// the kernel's thread — interrupt context uses ExternalSignal.

use alloc::rc::{Rc, Weak};
use core::cell::RefCell;
use core::mem;
use core::task::{RawWaker, RawWakerVTable, Waker};

use super::scheduler::Core;
use crate::task::TaskId;

pub(crate) struct WakeHook {
    pub(crate) core: Weak<RefCell<Core>>,
    pub(crate) task: TaskId,
}

impl WakeHook {
    fn wake(&self) {
        if let Some(core) = self.core.upgrade() {
            // the kernel never holds the borrow while a task runs, so
            // a wake from inside a poll lands on an unborrowed core
            core.borrow_mut().waker_wake(self.task);
        }
    }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

pub(crate) fn task_waker(hook: Rc<WakeHook>) -> Waker {
    unsafe { Waker::from_raw(RawWaker::new(Rc::into_raw(hook) as *const (), &VTABLE)) }
}

fn clone_raw(ptr: *const ()) -> RawWaker {
    let rc = unsafe { Rc::from_raw(ptr as *const WakeHook) };
    let cloned = rc.clone();
    mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

fn wake_raw(ptr: *const ()) {
    let rc = unsafe { Rc::from_raw(ptr as *const WakeHook) };
    rc.wake();
}

fn wake_by_ref_raw(ptr: *const ()) {
    let rc = unsafe { Rc::from_raw(ptr as *const WakeHook) };
    rc.wake();
    mem::forget(rc);
}

fn drop_raw(ptr: *const ()) {
    unsafe { drop(Rc::from_raw(ptr as *const WakeHook)) };
}

// Task-side kernel handle and the suspension primitives
//
// Runtime is a cheap clone tasks capture at spawn; every primitive
// goes through it. Each suspension future registers its wake condition
// in kernel state on first poll and returns Pending; the kernel never
// transfers control any other way. Every primitive checks the calling
// task's pending-cancellation flag before anything else, which is what
// makes suspension points the (only) cancellation delivery points.

use alloc::boxed::Box;
use alloc::rc::Weak;
use core::any::Any;
use core::cell::RefCell;
use core::future::Future;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::pin::Pin;
use core::task::{Context, Poll};

use super::scheduler::{Core, JoinProbe};
use crate::event::Event;
use crate::task::{Cancelled, Exit, Fault, SpawnError, TaskId};
use crate::time::{Chronometer, Duration, Instant};
use crate::wake::ExternalSignal;

pub(crate) type TaskOutput = Result<Box<dyn Any>, Exit>;
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = TaskOutput>>>;

/// Task-side handle to the running kernel. Captured by tasks at spawn;
/// all suspension primitives and spawning go through it.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) core: Weak<RefCell<Core>>,
}

impl Runtime {
    /// Admit a new task. The future runs to a `Result<T, Exit>`: `Ok`
    /// is the value `join` returns, `Err` carries cancellation or a
    /// fault. Admission is immediate (the task is Ready behind the
    /// current pass); failure is an explicit construction error.
    pub fn spawn<T, F>(&self, future: F) -> Result<TaskHandle<T>, SpawnError>
    where
        T: 'static,
        F: Future<Output = Result<T, Exit>> + 'static,
    {
        let core = self.core.upgrade().ok_or(SpawnError::Shutdown)?;
        core.borrow().may_spawn()?;
        let erased: TaskFuture =
            Box::pin(async move { future.await.map(|v| Box::new(v) as Box<dyn Any>) });
        let id = core.borrow_mut().spawn_erased(erased);
        Ok(TaskHandle {
            core: self.core.clone(),
            id,
            _result: PhantomData,
        })
    }

    /// Suspend the calling task for at least `duration`. Resumption is
    /// never early; it can be late by however long other ready tasks
    /// hold the CPU (measure with a [`Chronometer`]). `sleep(0)` is a
    /// plain yield.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            core: self.core.clone(),
            duration,
            queued: None,
        }
    }

    /// Give every other ready task one turn, then resume.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            core: self.core.clone(),
            parked: false,
        }
    }

    /// Create a fresh [`Event`].
    pub fn event(&self) -> Event {
        let id = self
            .core
            .upgrade()
            .map(|c| c.borrow_mut().new_event())
            .unwrap_or(0);
        Event {
            core: self.core.clone(),
            id,
        }
    }

    /// Suspend until `signal` is raised (possibly from an interrupt
    /// handler). An already-raised signal is consumed immediately
    /// without suspending.
    pub fn wait_external(&self, signal: &'static ExternalSignal) -> ExternalWait {
        ExternalWait {
            core: self.core.clone(),
            signal,
            registration: None,
        }
    }

    /// Current reading of the kernel's monotonic clock.
    pub fn now(&self) -> Instant {
        self.core
            .upgrade()
            .map(|c| c.borrow().clock_now())
            .unwrap_or(Instant::ZERO)
    }

    /// Start a [`Chronometer`] at the current instant.
    pub fn chronometer(&self) -> Chronometer {
        Chronometer::start(self)
    }
}

/// Owning handle to a spawned task. Single-owner: `join` consumes it,
/// dropping it detaches the task (it keeps running; its fault, if any,
/// falls to the kernel's fault policy).
pub struct TaskHandle<T> {
    pub(crate) core: Weak<RefCell<Core>>,
    pub(crate) id: TaskId,
    pub(crate) _result: PhantomData<fn() -> T>,
}

impl<T: 'static> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cancellation. If the task is sleeping or waiting it is
    /// pulled out of its queue and made Ready at once; the signal is
    /// delivered at its next suspension point. Cancelling a task that
    /// already terminated is a no-op.
    pub fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().cancel(self.id);
        }
    }

    /// Suspend until the task terminates and take its result; an
    /// already-terminal task resolves without suspending. The target's
    /// cancellation or fault is re-raised to the caller as `Err`.
    pub fn join(self) -> Join<T> {
        let this = ManuallyDrop::new(self);
        Join {
            core: this.core.clone(),
            target: this.id,
            registered: false,
            _result: PhantomData,
        }
    }

    /// Let the task run unobserved. Equivalent to dropping the handle.
    pub fn detach(self) {}
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let unobserved = core.borrow_mut().detach(self.id);
            drop(unobserved);
        }
    }
}

/// Future returned by [`Runtime::sleep`].
pub struct Sleep {
    core: Weak<RefCell<Core>>,
    duration: Duration,
    queued: Option<Instant>,
}

impl Future for Sleep {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.core.upgrade() else {
            return Poll::Ready(Err(Cancelled));
        };
        let mut core = core.borrow_mut();
        let Some(id) = core.current() else {
            log::error!("sleep polled outside a task");
            return Poll::Ready(Err(Cancelled));
        };
        if core.take_cancel(id) {
            return Poll::Ready(Err(Cancelled));
        }
        match this.queued {
            None => {
                let now = core.clock_now();
                if this.duration.is_zero() {
                    core.make_ready(id);
                } else {
                    core.register_sleep(id, now + this.duration);
                }
                this.queued = Some(now + this.duration);
                Poll::Pending
            }
            Some(at) => {
                if core.clock_now() >= at {
                    Poll::Ready(Ok(()))
                } else {
                    // stray waker fired early; go back to sleep
                    core.register_sleep(id, at);
                    Poll::Pending
                }
            }
        }
    }
}

/// Future returned by [`Runtime::yield_now`].
pub struct YieldNow {
    core: Weak<RefCell<Core>>,
    parked: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.core.upgrade() else {
            return Poll::Ready(Err(Cancelled));
        };
        let mut core = core.borrow_mut();
        let Some(id) = core.current() else {
            log::error!("yield_now polled outside a task");
            return Poll::Ready(Err(Cancelled));
        };
        if core.take_cancel(id) {
            return Poll::Ready(Err(Cancelled));
        }
        if this.parked {
            Poll::Ready(Ok(()))
        } else {
            this.parked = true;
            core.make_ready(id);
            Poll::Pending
        }
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait {
    core: Weak<RefCell<Core>>,
    event: u64,
    registration: Option<u64>,
}

impl EventWait {
    pub(crate) fn new(core: Weak<RefCell<Core>>, event: u64) -> Self {
        Self {
            core,
            event,
            registration: None,
        }
    }
}

impl Future for EventWait {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.core.upgrade() else {
            return Poll::Ready(Err(Cancelled));
        };
        let mut core = core.borrow_mut();
        let Some(id) = core.current() else {
            log::error!("event wait polled outside a task");
            return Poll::Ready(Err(Cancelled));
        };
        if core.take_cancel(id) {
            if let Some(seq) = this.registration {
                core.remove_event_waiter(this.event, id, seq);
            }
            return Poll::Ready(Err(Cancelled));
        }
        match this.registration {
            None => {
                this.registration = Some(core.register_event_wait(id, this.event));
                Poll::Pending
            }
            Some(seq) => {
                if core.event_waiting(this.event, id, seq) {
                    // stray waker; the signal hasn't fired, keep waiting
                    core.rewait_event(id, this.event);
                    Poll::Pending
                } else {
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

/// Future returned by [`Runtime::wait_external`].
pub struct ExternalWait {
    core: Weak<RefCell<Core>>,
    signal: &'static ExternalSignal,
    registration: Option<u64>,
}

impl Future for ExternalWait {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.core.upgrade() else {
            return Poll::Ready(Err(Cancelled));
        };
        let mut core = core.borrow_mut();
        let Some(id) = core.current() else {
            log::error!("external wait polled outside a task");
            return Poll::Ready(Err(Cancelled));
        };
        if core.take_cancel(id) {
            if let Some(seq) = this.registration {
                core.remove_external_waiter(this.signal, id, seq);
            }
            return Poll::Ready(Err(Cancelled));
        }
        match this.registration {
            None => {
                if this.signal.consume() {
                    return Poll::Ready(Ok(()));
                }
                this.registration = Some(core.register_external_wait(id, this.signal));
                Poll::Pending
            }
            Some(seq) => {
                if core.external_waiting(this.signal, id, seq) {
                    core.rewait_external(id, this.signal);
                    Poll::Pending
                } else {
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

/// Future returned by [`TaskHandle::join`].
pub struct Join<T> {
    core: Weak<RefCell<Core>>,
    target: TaskId,
    registered: bool,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> Future for Join<T> {
    type Output = Result<T, Exit>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.core.upgrade() else {
            return Poll::Ready(Err(Exit::Fault(Fault::new("join after kernel shutdown"))));
        };
        let mut guard = core.borrow_mut();
        let Some(caller) = guard.current() else {
            return Poll::Ready(Err(Exit::Fault(Fault::new("join polled outside a task"))));
        };
        if caller == this.target {
            return Poll::Ready(Err(Exit::Fault(Fault::new("task cannot join itself"))));
        }
        if guard.take_cancel(caller) {
            if this.registered {
                guard.remove_joiner(this.target, caller);
            }
            return Poll::Ready(Err(Exit::Cancelled));
        }
        let probe = guard.try_take_outcome(this.target);
        match probe {
            JoinProbe::Pending => {
                guard.register_join(caller, this.target);
                this.registered = true;
                Poll::Pending
            }
            JoinProbe::Gone => {
                Poll::Ready(Err(Exit::Fault(Fault::new("join on a retired task handle"))))
            }
            JoinProbe::Terminal(outcome) => {
                // release the core before dropping/unboxing a user value
                drop(guard);
                Poll::Ready(match outcome {
                    Ok(any) => match any.downcast::<T>() {
                        Ok(v) => Ok(*v),
                        Err(_) => Err(Exit::Fault(Fault::new("joined value had unexpected type"))),
                    },
                    Err(exit) => Err(exit),
                })
            }
        }
    }
}

// Deterministic test harness: a hand-driven clock plus a parker that
// advances it straight to each park deadline. Time only moves when the
// kernel idles, so every wake instant in a test is exact, and the park
// log doubles as proof that the idle policy never busy-polls.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use eventio::{Clock, Instant, Kernel, Parker, WakeSense};

#[derive(Clone, Default)]
pub struct VirtualClock {
    ticks: Rc<Cell<u64>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// Monotonic: moves forward only.
    pub fn advance_to(&self, ticks: u64) {
        if ticks > self.ticks.get() {
            self.ticks.set(ticks);
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.ticks.get())
    }
}

/// One park as the kernel requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Park {
    pub at: u64,
    pub deadline: Option<u64>,
    pub raised: bool,
}

pub type ParkLog = Rc<RefCell<Vec<Park>>>;

pub struct VirtualParker {
    clock: VirtualClock,
    log: ParkLog,
}

impl Parker for VirtualParker {
    fn park(&mut self, clock: &dyn Clock, deadline: Option<Instant>, sense: &WakeSense<'_>) {
        let raised = sense.any_raised();
        self.log.borrow_mut().push(Park {
            at: clock.now().ticks(),
            deadline: deadline.map(Instant::ticks),
            raised,
        });
        if raised {
            return;
        }
        match deadline {
            Some(d) => self.clock.advance_to(d.ticks()),
            None => panic!("parked forever: no timer pending, no signal raised"),
        }
    }
}

/// Kernel on virtual time, plus the clock and the park log.
pub fn harness() -> (Kernel, VirtualClock, ParkLog) {
    let clock = VirtualClock::new();
    let log: ParkLog = Rc::new(RefCell::new(Vec::new()));
    let parker = VirtualParker {
        clock: clock.clone(),
        log: log.clone(),
    };
    (Kernel::new(clock.clone()).with_parker(parker), clock, log)
}

/// Shared in-test recorder for task-side observations.
pub type Trace<T> = Rc<RefCell<Vec<T>>>;

pub fn trace<T>() -> Trace<T> {
    Rc::new(RefCell::new(Vec::new()))
}

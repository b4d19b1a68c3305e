// Tick-based time: Instant, Duration, the Clock trait, Chronometer
//
// The kernel thinks in abstract monotonic ticks; the platform decides
// what a tick is (its periodic timer interval) and implements Clock on
// top of whatever counter it has. No wall-clock conversions here.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use crate::kernel::Runtime;

/// A span of ticks. Arithmetic saturates; on a monotonic tick counter
/// wraparound is the platform's problem, overflow is not ours to panic on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration {
    ticks: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { ticks: 0 };

    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    pub const fn ticks(self) -> u64 {
        self.ticks
    }

    pub const fn is_zero(self) -> bool {
        self.ticks == 0
    }

    pub const fn saturating_add(self, other: Duration) -> Duration {
        Duration {
            ticks: self.ticks.saturating_add(other.ticks),
        }
    }

    pub const fn saturating_sub(self, other: Duration) -> Duration {
        Duration {
            ticks: self.ticks.saturating_sub(other.ticks),
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        self.saturating_add(rhs)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.ticks)
    }
}

/// A point on the monotonic tick line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant {
    ticks: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { ticks: 0 };

    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    pub const fn ticks(self) -> u64 {
        self.ticks
    }

    pub const fn saturating_add(self, d: Duration) -> Instant {
        Instant {
            ticks: self.ticks.saturating_add(d.ticks()),
        }
    }

    /// Ticks elapsed since `earlier`; zero if `earlier` is in the future.
    pub const fn saturating_since(self, earlier: Instant) -> Duration {
        Duration::from_ticks(self.ticks.saturating_sub(earlier.ticks))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.ticks)
    }
}

/// Monotonic tick source. External collaborator: the kernel only reads
/// it, the platform derives it from hardware (or a test drives it by
/// hand). Readings must never decrease.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Elapsed-time meter over the kernel's clock, independent of the
/// scheduler itself. Any task can keep one to measure how late its
/// wake-ups actually are (cooperative slack) or to time a section.
pub struct Chronometer {
    rt: Runtime,
    started: Instant,
    last: Instant,
}

impl Chronometer {
    pub fn start(rt: &Runtime) -> Self {
        let now = rt.now();
        Self {
            rt: rt.clone(),
            started: now,
            last: now,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Ticks since `start` (or the last `restart`).
    pub fn elapsed(&self) -> Duration {
        self.rt.now().saturating_since(self.started)
    }

    /// Ticks since the previous `lap` (or `start`).
    pub fn lap(&mut self) -> Duration {
        let now = self.rt.now();
        let d = now.saturating_since(self.last);
        self.last = now;
        d
    }

    pub fn restart(&mut self) {
        let now = self.rt.now();
        self.started = now;
        self.last = now;
    }
}

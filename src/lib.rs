// eventio — cooperative coroutine runtime for microcontrollers
//
// Single core, no preemption. Tasks are futures resumed by a
// single-threaded kernel; suspension happens only at explicit awaits
// (sleep, event wait, join, yield). ISRs reach the kernel through
// latched ExternalSignal flags; when nothing is ready the idle policy
// parks the CPU (WFI on hardware, spin as fallback) until the next
// timer deadline or an external raise.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod event;
pub mod kernel;
pub mod task;
pub mod time;
pub mod wake;

mod timer;

pub use event::Event;
pub use kernel::{Kernel, Runtime, TaskHandle};
pub use task::{Cancelled, Exit, Fault, FaultPolicy, RunError, SpawnError, TaskId};
pub use time::{Chronometer, Clock, Duration, Instant};
pub use wake::{ExternalSignal, Parker, SpinParker, WakeSense};

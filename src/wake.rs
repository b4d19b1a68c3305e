// ISR-to-kernel wake bridge and the idle/park policy
//
// Interrupt handlers raise latched signal flags; the kernel consumes
// them when it drains the bridge each pass. raise() is a plain atomic
// store — no RMW, no queue access — so it is callable from any
// interrupt context while the main loop mutates its queues. The
// consume side takes a critical section instead (the target class,
// e.g. riscv32imc, has no atomic RMW).

use core::sync::atomic::{AtomicBool, Ordering};

use crate::time::{Clock, Instant};

/// A waitable condition an interrupt handler can raise.
///
/// `const`-constructible so it can live in a `static` the ISR reaches:
///
///   static BUTTON: ExternalSignal = ExternalSignal::new();
///   // ISR:          BUTTON.raise();
///   // task:         rt.wait_external(&BUTTON).await?;
///
/// The flag is sticky: a raise with nobody waiting is remembered and
/// satisfies the next waiter immediately. A drain wakes every task
/// waiting at that moment (broadcast) and clears the flag.
#[derive(Debug)]
pub struct ExternalSignal {
    raised: AtomicBool,
}

impl ExternalSignal {
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    /// Latch the signal. Safe from interrupt context: a single atomic
    /// store, nothing else.
    #[inline]
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Peek without consuming.
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    // cs: load+clear must not lose a raise landing in between
    pub(crate) fn consume(&self) -> bool {
        critical_section::with(|_| {
            if self.raised.load(Ordering::Relaxed) {
                self.raised.store(false, Ordering::Relaxed);
                true
            } else {
                false
            }
        })
    }
}

impl Default for ExternalSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The signals the kernel is currently waiting on, handed to the
/// parker so it can end a park early when one is raised. Read-only:
/// consumption stays with the kernel's drain pass.
pub struct WakeSense<'a> {
    signals: &'a [&'static ExternalSignal],
}

impl<'a> WakeSense<'a> {
    pub(crate) fn new(signals: &'a [&'static ExternalSignal]) -> Self {
        Self { signals }
    }

    pub fn any_raised(&self) -> bool {
        self.signals.iter().any(|s| s.is_raised())
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }
}

/// Idle/power policy: what to do when no task is ready.
///
/// Contract: return no later than `deadline` (None means no timer is
/// pending — park until an external raise); return promptly once a
/// sensed signal is raised, including one raised between the kernel's
/// last drain and the park (the flags are latched, so checking them
/// first is sufficient). Spurious early returns are allowed — the
/// kernel re-evaluates and parks again.
///
/// Platforms with a low-power wait provide their own impl (a WFI loop
/// on hardware); [`SpinParker`] is the functionally equivalent
/// busy-poll fallback, differing only in power draw.
pub trait Parker {
    fn park(&mut self, clock: &dyn Clock, deadline: Option<Instant>, sense: &WakeSense<'_>);
}

/// Busy-poll parker for platforms without a power-down path.
#[derive(Debug, Default)]
pub struct SpinParker;

impl Parker for SpinParker {
    fn park(&mut self, clock: &dyn Clock, deadline: Option<Instant>, sense: &WakeSense<'_>) {
        loop {
            if sense.any_raised() {
                return;
            }
            match deadline {
                Some(d) => {
                    if clock.now() >= d {
                        return;
                    }
                }
                // nothing to spin for; the kernel flags this as a stall
                None => {
                    if sense.is_empty() {
                        return;
                    }
                }
            }
            core::hint::spin_loop();
        }
    }
}

// Idle policy: the kernel parks exactly on the timer queue's minimum,
// never spins when a park path exists, and reports a stall instead of
// parking forever on a condition nothing can signal.

mod common;

use common::harness;
use eventio::{Duration, Exit, RunError};

#[test]
fn park_deadline_is_the_timer_minimum() {
    let (kernel, _clock, parks) = harness();
    let out = kernel.run(|rt| async move {
        let ra = rt.clone();
        let a = rt.spawn(async move {
            ra.sleep(Duration::from_ticks(10)).await?;
            Ok::<(), Exit>(())
        })?;
        let rb = rt.clone();
        let b = rt.spawn(async move {
            rb.sleep(Duration::from_ticks(25)).await?;
            Ok::<(), Exit>(())
        })?;
        a.join().await?;
        b.join().await?;
        Ok::<u32, Exit>(0)
    });
    assert_eq!(out, Ok(0));
    let parks = parks.borrow();
    let deadlines: Vec<Option<u64>> = parks.iter().map(|p| p.deadline).collect();
    // one park per distinct wake-up, each at the exact minimum;
    // no intermediate polls, no spinning
    assert_eq!(deadlines, [Some(10), Some(25)]);
}

#[test]
fn no_idle_at_all_while_work_is_ready() {
    let (kernel, _clock, parks) = harness();
    let out = kernel.run(|rt| async move {
        for _ in 0..10 {
            rt.yield_now().await?;
        }
        Ok::<u32, Exit>(0)
    });
    assert_eq!(out, Ok(0));
    assert!(parks.borrow().is_empty());
}

#[test]
fn unwakeable_wait_is_reported_as_a_stall() {
    let (kernel, _clock, _parks) = harness();
    let out = kernel.run(|rt| async move {
        let ev = rt.event();
        // no other task, no timer, no external signal: nothing can
        // ever signal this
        ev.wait().await?;
        Ok::<u32, Exit>(0)
    });
    assert_eq!(out, Err(RunError::Stalled));
}

#[test]
fn stall_detection_sees_through_finished_helpers() {
    let (kernel, _clock, _parks) = harness();
    let out = kernel.run(|rt| async move {
        let r = rt.clone();
        let helper = rt.spawn(async move {
            r.sleep(Duration::from_ticks(3)).await?;
            Ok::<(), Exit>(())
        })?;
        helper.join().await?;
        // helper is gone; this wait is unwakeable now
        let ev = rt.event();
        ev.wait().await?;
        Ok::<u32, Exit>(0)
    });
    assert_eq!(out, Err(RunError::Stalled));
}

mod common;

use common::{harness, trace};
use eventio::{Duration, Exit};

#[test]
fn ready_tasks_resume_in_spawn_order() {
    let (kernel, _clock, _parks) = harness();
    let order = trace::<u32>();
    let out = kernel.run(|rt| async move {
        let mut handles = Vec::new();
        for n in 0..4u32 {
            let o = order.clone();
            handles.push(rt.spawn(async move {
                o.borrow_mut().push(n);
                Ok::<(), Exit>(())
            })?);
        }
        for h in handles {
            h.join().await?;
        }
        Ok::<_, Exit>(order.borrow().clone())
    });
    assert_eq!(out.unwrap(), [0, 1, 2, 3]);
}

#[test]
fn a_task_that_never_suspends_starves_everyone() {
    let (kernel, _clock, _parks) = harness();
    let order = trace::<&'static str>();
    let out = kernel.run(|rt| async move {
        let oa = order.clone();
        let hog = rt.spawn(async move {
            // no suspension point anywhere in here: the kernel cannot
            // take the CPU back, by design
            let mut acc = 0u64;
            for i in 0..100_000u64 {
                acc = acc.wrapping_add(i);
            }
            oa.borrow_mut().push("hog finished");
            Ok::<u64, Exit>(acc)
        })?;
        let ob = order.clone();
        let bystander = rt.spawn(async move {
            ob.borrow_mut().push("bystander ran");
            Ok::<(), Exit>(())
        })?;
        let sum = hog.join().await?;
        bystander.join().await?;
        assert!(sum > 0);
        Ok::<_, Exit>(order.borrow().clone())
    });
    // spawned first, the hog runs to completion before the bystander
    // gets a single resume
    assert_eq!(out.unwrap(), ["hog finished", "bystander ran"]);
}

#[test]
fn yield_now_hands_the_cpu_over() {
    let (kernel, _clock, _parks) = harness();
    let order = trace::<&'static str>();
    let out = kernel.run(|rt| async move {
        let oa = order.clone();
        let ra = rt.clone();
        let polite = rt.spawn(async move {
            oa.borrow_mut().push("a0");
            ra.yield_now().await?;
            oa.borrow_mut().push("a1");
            Ok::<(), Exit>(())
        })?;
        let ob = order.clone();
        let other = rt.spawn(async move {
            ob.borrow_mut().push("b0");
            Ok::<(), Exit>(())
        })?;
        polite.join().await?;
        other.join().await?;
        Ok::<_, Exit>(order.borrow().clone())
    });
    assert_eq!(out.unwrap(), ["a0", "b0", "a1"]);
}

#[test]
fn a_sequence_of_suspensions_stays_in_program_order() {
    let (kernel, _clock, _parks) = harness();
    let steps = trace::<u32>();
    let out = kernel.run(|rt| async move {
        let s = steps.clone();
        let r = rt.clone();
        let child = rt.spawn(async move {
            s.borrow_mut().push(1);
            r.sleep(Duration::from_ticks(1)).await?;
            s.borrow_mut().push(2);
            r.yield_now().await?;
            s.borrow_mut().push(3);
            r.sleep(Duration::from_ticks(1)).await?;
            s.borrow_mut().push(4);
            Ok::<(), Exit>(())
        })?;
        child.join().await?;
        Ok::<_, Exit>(steps.borrow().clone())
    });
    assert_eq!(out.unwrap(), [1, 2, 3, 4]);
}

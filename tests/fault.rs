// Failure paths: the unjoined-fault policy, spawn admission errors,
// root failure propagation, and handles that outlive the run.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::harness;
use eventio::{Duration, Exit, Fault, FaultPolicy, Runtime, RunError, SpawnError};
use log::{Level, LevelFilter, Log, Metadata, Record};

static UNJOINED_WARNINGS: AtomicUsize = AtomicUsize::new(0);

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record<'_>) {
        if record.level() == Level::Warn
            && record.args().to_string().contains("nobody joining")
        {
            UNJOINED_WARNINGS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

fn run_with_detached_failure(policy: FaultPolicy) {
    let (kernel, _clock, _parks) = harness();
    let out = kernel.fault_policy(policy).run(|rt| async move {
        let r = rt.clone();
        let doomed = rt.spawn(async move {
            r.sleep(Duration::from_ticks(1)).await?;
            Err::<(), Exit>(Exit::Fault(Fault::new("flash write refused")))
        })?;
        doomed.detach();
        rt.sleep(Duration::from_ticks(5)).await?;
        Ok::<u32, Exit>(0)
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn unjoined_fault_policy_is_explicit_and_configurable() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Warn);

    // run both policies in one test so the process-wide logger and
    // counter stay deterministic
    run_with_detached_failure(FaultPolicy::Silent);
    assert_eq!(UNJOINED_WARNINGS.load(Ordering::SeqCst), 0);

    run_with_detached_failure(FaultPolicy::Log);
    assert_eq!(UNJOINED_WARNINGS.load(Ordering::SeqCst), 1);
}

#[test]
fn spawn_past_the_task_limit_is_a_construction_error() {
    let (kernel, _clock, _parks) = harness();
    let out = kernel.max_tasks(2).run(|rt| async move {
        let r = rt.clone();
        let first = rt.spawn(async move {
            r.sleep(Duration::from_ticks(4)).await?;
            Ok::<(), Exit>(())
        })?;
        // root + sleeper fill the table
        let second = rt.spawn(async move { Ok::<(), Exit>(()) });
        assert_eq!(second.err(), Some(SpawnError::Capacity));
        // the failed spawn poisoned nothing
        first.join().await?;
        Ok::<u32, Exit>(0)
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn root_fault_reaches_the_caller() {
    let (kernel, _clock, _parks) = harness();
    let out = kernel.run(|rt| async move {
        rt.sleep(Duration::from_ticks(1)).await?;
        Err::<u32, Exit>(Exit::Fault(Fault::new("config missing")))
    });
    assert_eq!(out, Err(RunError::Fault(Fault::new("config missing"))));
}

#[test]
fn a_runtime_that_outlives_the_run_refuses_to_spawn() {
    let (kernel, _clock, _parks) = harness();
    let escaped = kernel
        .run(|rt| async move { Ok::<Runtime, Exit>(rt.clone()) })
        .unwrap();
    let res = escaped.spawn(async move { Ok::<(), Exit>(()) });
    assert_eq!(res.err(), Some(SpawnError::Shutdown));
}

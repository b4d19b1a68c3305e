// Task identity, state machine, and the terminal result model
//
// Cancellation and failure are separate kinds on purpose: join callers
// and cleanup code discriminate them by matching on Exit, no unwinding
// involved. A task is Done, Cancelled or Failed exactly once and the
// outcome slot is written exactly once.

use core::fmt;

use crate::time::Instant;

/// Opaque task handle identity: slot index plus a generation stamp so
/// a handle that outlives its slot can be told apart from the slot's
/// next tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}.{}", self.index, self.generation)
    }
}

/// What a suspended task is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitSource {
    /// A kernel Event, by id.
    Event(u64),
    /// Another task's completion (join).
    Task(TaskId),
    /// An ExternalSignal, keyed by its address.
    External(usize),
    /// A foreign future that will use the task's waker.
    Waker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Created,
    Ready,
    Running,
    Sleeping { until: Instant },
    Waiting { on: WaitSource },
    Done,
    Cancelled,
    Failed,
}

impl TaskState {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Cancelled | TaskState::Failed
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Sleeping { until } => write!(f, "sleeping({until})"),
            TaskState::Waiting { on: WaitSource::Event(id) } => write!(f, "waiting(event {id})"),
            TaskState::Waiting { on: WaitSource::Task(t) } => write!(f, "waiting({t})"),
            TaskState::Waiting { on: WaitSource::External(_) } => write!(f, "waiting(external)"),
            TaskState::Waiting { on: WaitSource::Waker } => write!(f, "waiting(waker)"),
            TaskState::Done => write!(f, "done"),
            TaskState::Cancelled => write!(f, "cancelled"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// The cancellation signal. Delivered by a suspension primitive at the
/// task's next suspension point, never mid-computation. Catch it to run
/// cleanup, then let it propagate (`?` into [`Exit`]); completing
/// normally afterwards suppresses the cancellation instead — that is
/// allowed but on the task's own head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

/// An ordinary task failure, as opposed to a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    msg: &'static str,
}

impl Fault {
    pub const fn new(msg: &'static str) -> Self {
        Self { msg }
    }

    pub const fn message(&self) -> &'static str {
        self.msg
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

/// Why a task terminated without a value. `join` re-raises this to the
/// caller; cleanup code matches on it to tell cancellation from failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Cancelled,
    Fault(Fault),
}

impl From<Cancelled> for Exit {
    fn from(_: Cancelled) -> Self {
        Exit::Cancelled
    }
}

impl From<Fault> for Exit {
    fn from(f: Fault) -> Self {
        Exit::Fault(f)
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Cancelled => write!(f, "cancelled"),
            Exit::Fault(fault) => write!(f, "fault: {fault}"),
        }
    }
}

/// Spawn admission failure. Fatal to the spawn call, not to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The kernel run this handle belonged to has ended.
    Shutdown,
    /// The configured task limit is reached.
    Capacity,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Shutdown => write!(f, "kernel is shut down"),
            SpawnError::Capacity => write!(f, "task limit reached"),
        }
    }
}

impl From<SpawnError> for Exit {
    fn from(e: SpawnError) -> Self {
        Exit::Fault(match e {
            SpawnError::Shutdown => Fault::new("spawn failed: kernel is shut down"),
            SpawnError::Capacity => Fault::new("spawn failed: task limit reached"),
        })
    }
}

/// What to do with the fault of a task nobody joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Report through `log::warn!`.
    #[default]
    Log,
    /// Drop it without a trace.
    Silent,
}

/// Terminal result of a whole `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// The root task was cancelled.
    Cancelled,
    /// The root task failed.
    Fault(Fault),
    /// Every live task was blocked on a condition nothing can ever
    /// signal: no ready work, no pending timer, no external wait.
    Stalled,
}

impl From<Exit> for RunError {
    fn from(e: Exit) -> Self {
        match e {
            Exit::Cancelled => RunError::Cancelled,
            Exit::Fault(f) => RunError::Fault(f),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Cancelled => write!(f, "root task cancelled"),
            RunError::Fault(fault) => write!(f, "root task failed: {fault}"),
            RunError::Stalled => write!(f, "all tasks blocked with nothing to wake them"),
        }
    }
}

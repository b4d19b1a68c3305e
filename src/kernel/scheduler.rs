// Kernel core: task table, ready/timer queues, and the run loop
//
// One pass: drain the ISR bridge, release due timers, resume the tasks
// that were ready at the top of the pass in FIFO order, then idle via
// the parker when nothing is ready. The core is never borrowed while a
// task runs, so task code is free to spawn, cancel, signal and sleep
// through its Runtime handle mid-poll.
//
// Queue discipline: a task sits in at most one of {ready queue, timer
// queue, one waiter set} or is running/terminal. Removal is lazy —
// state plus a per-suspension sequence number decide whether a
// surfacing entry is still meant — so cancellation costs O(1)
// bookkeeping on top of the O(log n) heap.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::future::Future;
use core::mem;
use core::task::{Context, Poll};

use log::{debug, error, trace, warn};

use super::runtime::{Runtime, TaskFuture, TaskHandle, TaskOutput};
use super::waker::{WakeHook, task_waker};
use crate::task::{Exit, Fault, FaultPolicy, RunError, SpawnError, TaskId, TaskState, WaitSource};
use crate::time::{Clock, Instant};
use crate::timer::{TimerEntry, TimerQueue};
use crate::wake::{ExternalSignal, Parker, SpinParker, WakeSense};

struct Slot {
    spawn_seq: u64,
    state: TaskState,
    cancel_pending: bool,
    detached: bool,
    woke_in_poll: bool,
    /// Bumped on every suspension registration; queue entries and
    /// waiter registrations carry the value they were made with.
    wait_seq: u64,
    future: Option<TaskFuture>,
    outcome: Option<TaskOutput>,
    joiner: Option<TaskId>,
}

struct Entry {
    generation: u32,
    slot: Option<Slot>,
}

struct ExternalEntry {
    signal: &'static ExternalSignal,
    waiters: VecDeque<(TaskId, u64)>,
}

/// Result of probing a task for its terminal outcome.
pub(crate) enum JoinProbe {
    Pending,
    Terminal(TaskOutput),
    Gone,
}

pub(crate) struct Core {
    clock: Box<dyn Clock>,
    entries: Vec<Entry>,
    free: Vec<u32>,
    ready: VecDeque<TaskId>,
    timers: TimerQueue,
    events: BTreeMap<u64, VecDeque<(TaskId, u64)>>,
    next_event: u64,
    externals: Vec<ExternalEntry>,
    pub(crate) current: Option<TaskId>,
    spawned: u64,
    live: usize,
    max_tasks: usize,
    fault_policy: FaultPolicy,
}

fn signal_key(signal: &'static ExternalSignal) -> usize {
    signal as *const ExternalSignal as usize
}

/// Wake `id` out of a waiter set if the registration is still current.
fn wake_waiting(
    entries: &mut [Entry],
    ready: &mut VecDeque<TaskId>,
    id: TaskId,
    seq: u64,
    source: WaitSource,
) -> bool {
    let Some(entry) = entries.get_mut(id.index as usize) else {
        return false;
    };
    if entry.generation != id.generation {
        return false;
    }
    let Some(slot) = entry.slot.as_mut() else {
        return false;
    };
    if slot.state != (TaskState::Waiting { on: source }) || slot.wait_seq != seq {
        return false;
    }
    slot.state = TaskState::Ready;
    ready.push_back(id);
    true
}

fn wake_sleeping(entries: &mut [Entry], ready: &mut VecDeque<TaskId>, e: &TimerEntry) -> bool {
    let Some(entry) = entries.get_mut(e.task.index as usize) else {
        return false;
    };
    if entry.generation != e.task.generation {
        return false;
    }
    let Some(slot) = entry.slot.as_mut() else {
        return false;
    };
    if !matches!(slot.state, TaskState::Sleeping { .. }) || slot.wait_seq != e.seq {
        return false;
    }
    slot.state = TaskState::Ready;
    ready.push_back(e.task);
    true
}

fn wake_joiner(entries: &mut [Entry], ready: &mut VecDeque<TaskId>, joiner: TaskId, target: TaskId) {
    let Some(entry) = entries.get_mut(joiner.index as usize) else {
        return;
    };
    if entry.generation != joiner.generation {
        return;
    }
    let Some(slot) = entry.slot.as_mut() else {
        return;
    };
    if slot.state != (TaskState::Waiting { on: WaitSource::Task(target) }) {
        return;
    }
    slot.state = TaskState::Ready;
    ready.push_back(joiner);
}

fn entry_sleeping(entries: &[Entry], e: &TimerEntry) -> bool {
    let Some(entry) = entries.get(e.task.index as usize) else {
        return false;
    };
    if entry.generation != e.task.generation {
        return false;
    }
    let Some(slot) = entry.slot.as_ref() else {
        return false;
    };
    matches!(slot.state, TaskState::Sleeping { .. }) && slot.wait_seq == e.seq
}

fn log_unobserved(policy: FaultPolicy, id: TaskId, outcome: &TaskOutput) {
    match outcome {
        Err(Exit::Fault(fault)) => {
            if policy == FaultPolicy::Log {
                warn!("{id} failed with nobody joining: {fault}");
            }
        }
        Err(Exit::Cancelled) => trace!("{id} cancelled, unobserved"),
        Ok(_) => {}
    }
}

impl Core {
    fn new(clock: Box<dyn Clock>, fault_policy: FaultPolicy, max_tasks: usize) -> Self {
        Self {
            clock,
            entries: Vec::new(),
            free: Vec::new(),
            ready: VecDeque::new(),
            timers: TimerQueue::new(),
            events: BTreeMap::new(),
            next_event: 1,
            externals: Vec::new(),
            current: None,
            spawned: 0,
            live: 0,
            max_tasks,
            fault_policy,
        }
    }

    fn slot_mut(&mut self, id: TaskId) -> Option<&mut Slot> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_mut()
    }

    fn slot(&self, id: TaskId) -> Option<&Slot> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_ref()
    }

    fn free_slot(&mut self, id: TaskId) {
        if let Some(entry) = self.entries.get_mut(id.index as usize) {
            if entry.generation == id.generation && entry.slot.is_some() {
                entry.slot = None;
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub(crate) fn clock_now(&self) -> Instant {
        self.clock.now()
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    // ── admission ───────────────────────────────────────────────────

    /// Checked before the continuation is handed over, so a rejected
    /// future is never dropped while the core is borrowed (it may own
    /// task handles whose destructors reach back in).
    pub(crate) fn may_spawn(&self) -> Result<(), SpawnError> {
        if self.live >= self.max_tasks {
            return Err(SpawnError::Capacity);
        }
        Ok(())
    }

    pub(crate) fn spawn_erased(&mut self, future: TaskFuture) -> TaskId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: None,
                });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        let id = TaskId {
            index,
            generation: entry.generation,
        };
        entry.slot = Some(Slot {
            spawn_seq: self.spawned,
            state: TaskState::Created,
            cancel_pending: false,
            detached: false,
            woke_in_poll: false,
            wait_seq: 0,
            future: Some(future),
            outcome: None,
            joiner: None,
        });
        self.spawned += 1;
        self.live += 1;
        // admission: Created -> Ready, behind everything already queued
        if let Some(slot) = entry.slot.as_mut() {
            slot.state = TaskState::Ready;
        }
        self.ready.push_back(id);
        trace!("{id} spawned");
        id
    }

    // ── suspension bookkeeping (called from primitives mid-poll) ────

    pub(crate) fn take_cancel(&mut self, id: TaskId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.cancel_pending => {
                slot.cancel_pending = false;
                trace!("{id} observed cancellation");
                true
            }
            _ => false,
        }
    }

    pub(crate) fn make_ready(&mut self, id: TaskId) {
        match self.slot_mut(id) {
            Some(slot) if !slot.state.is_terminal() => slot.state = TaskState::Ready,
            _ => return,
        }
        self.ready.push_back(id);
    }

    pub(crate) fn register_sleep(&mut self, id: TaskId, at: Instant) {
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        slot.wait_seq += 1;
        slot.state = TaskState::Sleeping { until: at };
        let spawn_seq = slot.spawn_seq;
        let seq = slot.wait_seq;
        self.timers.insert(TimerEntry {
            at,
            spawn_seq,
            seq,
            task: id,
        });
        trace!("{id} sleeping until {at}");
    }

    pub(crate) fn new_event(&mut self) -> u64 {
        let id = self.next_event;
        self.next_event += 1;
        self.events.insert(id, VecDeque::new());
        id
    }

    pub(crate) fn register_event_wait(&mut self, id: TaskId, event: u64) -> u64 {
        let seq = {
            let Some(slot) = self.slot_mut(id) else {
                return 0;
            };
            slot.wait_seq += 1;
            slot.state = TaskState::Waiting {
                on: WaitSource::Event(event),
            };
            slot.wait_seq
        };
        self.events.entry(event).or_default().push_back((id, seq));
        seq
    }

    pub(crate) fn event_waiting(&self, event: u64, id: TaskId, seq: u64) -> bool {
        self.events
            .get(&event)
            .is_some_and(|w| w.contains(&(id, seq)))
    }

    pub(crate) fn rewait_event(&mut self, id: TaskId, event: u64) {
        if let Some(slot) = self.slot_mut(id) {
            slot.state = TaskState::Waiting {
                on: WaitSource::Event(event),
            };
        }
    }

    pub(crate) fn remove_event_waiter(&mut self, event: u64, id: TaskId, seq: u64) {
        if let Some(waiters) = self.events.get_mut(&event) {
            waiters.retain(|w| *w != (id, seq));
        }
    }

    pub(crate) fn signal_event(&mut self, event: u64, all: bool) {
        let Core {
            events,
            entries,
            ready,
            ..
        } = self;
        let Some(waiters) = events.get_mut(&event) else {
            return;
        };
        while let Some((id, seq)) = waiters.pop_front() {
            if wake_waiting(entries, ready, id, seq, WaitSource::Event(event)) {
                trace!("{id} woken by event {event}");
                if !all {
                    break;
                }
            }
        }
    }

    pub(crate) fn register_external_wait(
        &mut self,
        id: TaskId,
        signal: &'static ExternalSignal,
    ) -> u64 {
        let key = signal_key(signal);
        let seq = {
            let Some(slot) = self.slot_mut(id) else {
                return 0;
            };
            slot.wait_seq += 1;
            slot.state = TaskState::Waiting {
                on: WaitSource::External(key),
            };
            slot.wait_seq
        };
        match self
            .externals
            .iter_mut()
            .find(|e| signal_key(e.signal) == key)
        {
            Some(entry) => entry.waiters.push_back((id, seq)),
            None => {
                let mut waiters = VecDeque::new();
                waiters.push_back((id, seq));
                self.externals.push(ExternalEntry { signal, waiters });
            }
        }
        seq
    }

    pub(crate) fn external_waiting(
        &self,
        signal: &'static ExternalSignal,
        id: TaskId,
        seq: u64,
    ) -> bool {
        let key = signal_key(signal);
        self.externals
            .iter()
            .find(|e| signal_key(e.signal) == key)
            .is_some_and(|e| e.waiters.contains(&(id, seq)))
    }

    pub(crate) fn rewait_external(&mut self, id: TaskId, signal: &'static ExternalSignal) {
        let key = signal_key(signal);
        if let Some(slot) = self.slot_mut(id) {
            slot.state = TaskState::Waiting {
                on: WaitSource::External(key),
            };
        }
    }

    pub(crate) fn remove_external_waiter(
        &mut self,
        signal: &'static ExternalSignal,
        id: TaskId,
        seq: u64,
    ) {
        self.remove_external_by_key(signal_key(signal), id, seq);
    }

    fn remove_external_by_key(&mut self, key: usize, id: TaskId, seq: u64) {
        if let Some(entry) = self
            .externals
            .iter_mut()
            .find(|e| signal_key(e.signal) == key)
        {
            entry.waiters.retain(|w| *w != (id, seq));
        }
        self.externals.retain(|e| !e.waiters.is_empty());
    }

    pub(crate) fn register_join(&mut self, caller: TaskId, target: TaskId) {
        if let Some(slot) = self.slot_mut(target) {
            slot.joiner = Some(caller);
        }
        if let Some(slot) = self.slot_mut(caller) {
            slot.wait_seq += 1;
            slot.state = TaskState::Waiting {
                on: WaitSource::Task(target),
            };
        }
    }

    pub(crate) fn remove_joiner(&mut self, target: TaskId, caller: TaskId) {
        if let Some(slot) = self.slot_mut(target) {
            if slot.joiner == Some(caller) {
                slot.joiner = None;
            }
        }
    }

    pub(crate) fn try_take_outcome(&mut self, target: TaskId) -> JoinProbe {
        let outcome = {
            let Some(entry) = self.entries.get_mut(target.index as usize) else {
                return JoinProbe::Gone;
            };
            if entry.generation != target.generation {
                return JoinProbe::Gone;
            }
            let Some(slot) = entry.slot.as_mut() else {
                return JoinProbe::Gone;
            };
            if !slot.state.is_terminal() {
                return JoinProbe::Pending;
            }
            match slot.outcome.take() {
                Some(out) => out,
                None => return JoinProbe::Gone,
            }
        };
        self.free_slot(target);
        JoinProbe::Terminal(outcome)
    }

    // ── cancellation / detach ───────────────────────────────────────

    pub(crate) fn cancel(&mut self, id: TaskId) {
        let (was, seq) = {
            let Some(slot) = self.slot_mut(id) else {
                return;
            };
            if slot.state.is_terminal() {
                return;
            }
            slot.cancel_pending = true;
            (slot.state, slot.wait_seq)
        };
        trace!("{id} cancellation requested while {was}");
        match was {
            TaskState::Sleeping { .. } => {
                // the timer entry goes stale through the state change
                self.make_ready(id);
            }
            TaskState::Waiting { on } => {
                match on {
                    WaitSource::Event(event) => self.remove_event_waiter(event, id, seq),
                    WaitSource::Task(target) => self.remove_joiner(target, id),
                    WaitSource::External(key) => self.remove_external_by_key(key, id, seq),
                    WaitSource::Waker => {}
                }
                self.make_ready(id);
            }
            _ => {}
        }
    }

    /// Give up observation of a task. Returns a terminal outcome the
    /// caller must drop outside the core borrow (it may hold user data
    /// with arbitrary destructors).
    pub(crate) fn detach(&mut self, id: TaskId) -> Option<TaskOutput> {
        let policy = self.fault_policy;
        let terminal = {
            let slot = self.slot_mut(id)?;
            if slot.state.is_terminal() {
                true
            } else {
                slot.detached = true;
                false
            }
        };
        if !terminal {
            return None;
        }
        let outcome = self.slot_mut(id).and_then(|s| s.outcome.take());
        if let Some(out) = outcome.as_ref() {
            log_unobserved(policy, id, out);
        }
        self.free_slot(id);
        outcome
    }

    // ── resumption protocol ─────────────────────────────────────────

    fn begin_resume(&mut self, id: TaskId) -> Option<TaskFuture> {
        let slot = self.slot_mut(id)?;
        if slot.state != TaskState::Ready {
            // stale ready entry: skip
            return None;
        }
        slot.state = TaskState::Running;
        let future = slot.future.take();
        if future.is_none() {
            // a Ready task always owns its continuation; this is a
            // kernel bug, not a task failure
            panic!("{id} resumed without a continuation");
        }
        self.current = Some(id);
        future
    }

    fn park_pending(&mut self, id: TaskId, future: TaskFuture) {
        let mut requeue = false;
        {
            let Some(slot) = self.slot_mut(id) else {
                return;
            };
            slot.future = Some(future);
            let woke = mem::take(&mut slot.woke_in_poll);
            if slot.state == TaskState::Running {
                // no primitive registered anything: a foreign future
                // holds our waker
                slot.wait_seq += 1;
                slot.state = TaskState::Waiting {
                    on: WaitSource::Waker,
                };
            }
            if woke && slot.state != TaskState::Ready {
                slot.state = TaskState::Ready;
                requeue = true;
            }
        }
        if requeue {
            self.ready.push_back(id);
        }
    }

    /// Terminal transition. Returns an unobserved outcome for the
    /// caller to drop outside the borrow, if the task was detached.
    fn finish(&mut self, id: TaskId, output: TaskOutput) -> Option<TaskOutput> {
        let state = match &output {
            Ok(_) => TaskState::Done,
            Err(Exit::Cancelled) => TaskState::Cancelled,
            Err(Exit::Fault(_)) => TaskState::Failed,
        };
        let policy = self.fault_policy;
        let (joiner, detached) = {
            let Some(slot) = self.slot_mut(id) else {
                panic!("{id} finished without a slot");
            };
            slot.state = state;
            slot.outcome = Some(output);
            slot.cancel_pending = false;
            (slot.joiner.take(), slot.detached)
        };
        self.live -= 1;
        trace!("{id} -> {state}");
        if let Some(j) = joiner {
            // the implicit completion event
            let Core { entries, ready, .. } = self;
            wake_joiner(entries, ready, j, id);
        }
        if detached {
            let outcome = self.slot_mut(id).and_then(|s| s.outcome.take());
            if let Some(out) = outcome.as_ref() {
                log_unobserved(policy, id, out);
            }
            self.free_slot(id);
            return outcome;
        }
        None
    }

    pub(crate) fn waker_wake(&mut self, id: TaskId) {
        let mut requeue = false;
        {
            let Some(slot) = self.slot_mut(id) else {
                return;
            };
            match slot.state {
                TaskState::Running => slot.woke_in_poll = true,
                TaskState::Sleeping { .. } | TaskState::Waiting { .. } => {
                    slot.state = TaskState::Ready;
                    requeue = true;
                }
                _ => {}
            }
        }
        if requeue {
            trace!("{id} woken by waker");
            self.ready.push_back(id);
        }
    }

    // ── pass plumbing ───────────────────────────────────────────────

    fn drain_externals(&mut self) {
        let Core {
            externals,
            entries,
            ready,
            ..
        } = self;
        for ext in externals.iter_mut() {
            if ext.waiters.is_empty() || !ext.signal.consume() {
                continue;
            }
            // broadcast: everyone registered at the raise gets up
            let key = signal_key(ext.signal);
            while let Some((id, seq)) = ext.waiters.pop_front() {
                if wake_waiting(entries, ready, id, seq, WaitSource::External(key)) {
                    trace!("{id} woken by external signal");
                }
            }
        }
        externals.retain(|e| !e.waiters.is_empty());
    }

    fn release_due_timers(&mut self) {
        let now = self.clock.now();
        let Core {
            timers,
            entries,
            ready,
            ..
        } = self;
        while let Some(e) = timers.pop_due(now, |e| entry_sleeping(entries, e)) {
            let woken = wake_sleeping(entries, ready, &e);
            debug_assert!(woken, "due timer entry went stale after validation");
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        let Core {
            timers, entries, ..
        } = self;
        timers.next_deadline(|e| entry_sleeping(entries, e))
    }

    fn sense_signals(&self) -> Vec<&'static ExternalSignal> {
        self.externals
            .iter()
            .filter(|e| !e.waiters.is_empty())
            .map(|e| e.signal)
            .collect()
    }

    fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    fn ready_len(&self) -> usize {
        self.ready.len()
    }

    fn is_terminal_or_gone(&self, id: TaskId) -> bool {
        match self.slot(id) {
            Some(slot) => slot.state.is_terminal(),
            None => true,
        }
    }

    /// Tear the table down; futures and outcomes go back to the caller
    /// so user destructors never run under the core borrow.
    fn teardown_collect(&mut self) -> (Vec<TaskFuture>, Vec<TaskOutput>) {
        let policy = self.fault_policy;
        let mut unfinished = 0usize;
        let mut futures = Vec::new();
        let mut outcomes = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let Some(mut slot) = entry.slot.take() else {
                continue;
            };
            let id = TaskId {
                index: index as u32,
                generation: entry.generation,
            };
            if !slot.state.is_terminal() {
                unfinished += 1;
            }
            if let Some(f) = slot.future.take() {
                futures.push(f);
            }
            if let Some(out) = slot.outcome.take() {
                log_unobserved(policy, id, &out);
                outcomes.push(out);
            }
            entry.generation = entry.generation.wrapping_add(1);
        }
        if unfinished > 0 {
            debug!("teardown: dropping {unfinished} unfinished tasks");
        }
        self.free.clear();
        self.ready.clear();
        self.timers.clear();
        self.events.clear();
        self.externals.clear();
        self.live = 0;
        (futures, outcomes)
    }
}

/// Resume one task: take its continuation out of the table, poll it
/// with the core unborrowed, then interpret what came back.
fn resume(core: &Rc<RefCell<Core>>, id: TaskId) {
    let Some(mut future) = core.borrow_mut().begin_resume(id) else {
        return;
    };
    let waker = task_waker(Rc::new(WakeHook {
        core: Rc::downgrade(core),
        task: id,
    }));
    let mut cx = Context::from_waker(&waker);
    let polled = future.as_mut().poll(&mut cx);
    let mut guard = core.borrow_mut();
    guard.current = None;
    match polled {
        Poll::Pending => {
            guard.park_pending(id, future);
            drop(guard);
        }
        Poll::Ready(output) => {
            let unobserved = guard.finish(id, output);
            drop(guard);
            drop(unobserved);
        }
    }
}

fn teardown(core: &Rc<RefCell<Core>>) {
    let collected = core.borrow_mut().teardown_collect();
    drop(collected);
}

/// The scheduler. Configure, then `run` a root task to completion.
///
///   let out = Kernel::new(clock).run(|rt| async move {
///       let blink = rt.spawn(blinker(rt.clone()))?;
///       rt.sleep(Duration::from_ticks(100)).await?;
///       blink.cancel();
///       let _ = blink.join().await;
///       Ok(0u32)
///   });
pub struct Kernel {
    clock: Box<dyn Clock>,
    parker: Box<dyn Parker>,
    fault_policy: FaultPolicy,
    max_tasks: usize,
}

impl Kernel {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            parker: Box::new(SpinParker),
            fault_policy: FaultPolicy::default(),
            max_tasks: usize::MAX,
        }
    }

    /// Replace the idle policy (default: busy-poll [`SpinParker`]).
    /// Platforms with a power-down path install their WFI parker here.
    pub fn with_parker(mut self, parker: impl Parker + 'static) -> Self {
        self.parker = Box::new(parker);
        self
    }

    /// What to do with the fault of a task nobody joins.
    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Cap concurrent (non-terminal) tasks; further spawns fail with
    /// [`SpawnError::Capacity`].
    pub fn max_tasks(mut self, limit: usize) -> Self {
        self.max_tasks = limit;
        self
    }

    /// Create the root task from `entry` and drive the loop until the
    /// root terminates. Tasks still alive at that point are dropped.
    pub fn run<T, F, Fut>(self, entry: F) -> Result<T, RunError>
    where
        T: 'static,
        F: FnOnce(Runtime) -> Fut,
        Fut: Future<Output = Result<T, Exit>> + 'static,
    {
        let Kernel {
            clock,
            mut parker,
            fault_policy,
            max_tasks,
        } = self;
        let core = Rc::new(RefCell::new(Core::new(clock, fault_policy, max_tasks)));
        let rt = Runtime {
            core: Rc::downgrade(&core),
        };
        let handle: TaskHandle<T> = match rt.spawn(entry(rt.clone())) {
            Ok(h) => h,
            Err(e) => {
                error!("root task rejected: {e}");
                return Err(RunError::Fault(Fault::new("root task rejected")));
            }
        };
        let root = handle.id();

        loop {
            {
                let mut guard = core.borrow_mut();
                guard.drain_externals();
                guard.release_due_timers();
            }
            // service exactly the tasks ready at the top of this pass;
            // whatever they wake runs next pass, after the timer check
            let pass = core.borrow().ready_len();
            for _ in 0..pass {
                let Some(id) = core.borrow_mut().pop_ready() else {
                    break;
                };
                resume(&core, id);
            }
            let (root_done, more_ready) = {
                let guard = core.borrow();
                (guard.is_terminal_or_gone(root), guard.ready_len() > 0)
            };
            if root_done {
                break;
            }
            if more_ready {
                continue;
            }
            // idle: find the next mandatory wake-up and park
            let (deadline, signals) = {
                let mut guard = core.borrow_mut();
                (guard.next_deadline(), guard.sense_signals())
            };
            if deadline.is_none() && signals.is_empty() {
                error!("stall: every task is blocked and nothing can wake them");
                teardown(&core);
                return Err(RunError::Stalled);
            }
            {
                let guard = core.borrow();
                parker.park(guard.clock(), deadline, &WakeSense::new(&signals));
            }
        }

        let probe = core.borrow_mut().try_take_outcome(root);
        teardown(&core);
        match probe {
            JoinProbe::Terminal(Ok(any)) => match any.downcast::<T>() {
                Ok(v) => Ok(*v),
                Err(_) => Err(RunError::Fault(Fault::new("root result had unexpected type"))),
            },
            JoinProbe::Terminal(Err(exit)) => Err(exit.into()),
            JoinProbe::Pending | JoinProbe::Gone => {
                Err(RunError::Fault(Fault::new("root task vanished")))
            }
        }
    }
}

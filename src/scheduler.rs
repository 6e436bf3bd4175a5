//! Deterministic virtual-time scheduler backing every simulated looper.
//!
//! Work is posted as a [`Runnable`] together with a delay in virtual
//! milliseconds. Whether it runs right away or waits for the test to move
//! the clock depends on the scheduler's [`IdleState`]:
//!
//! - **paused:** nothing runs until the test calls one of the `advance_*`
//!   or `run_*` methods
//! - **unpaused:** anything already due runs inline, before `post` returns;
//!   future work waits for the clock
//! - **constant idle:** everything posted runs inline and the clock is
//!   carried forward to each task's time
//!
//! # Ordering
//!
//! Tasks run in ascending `(scheduled_time, seq)` order. A front-of-queue
//! post is scheduled at the current time and placed ahead of every other task
//! sharing that instant; among several front posts the most recent wins.
//!
//! The clock never moves backwards. It moves forward only when the test
//! advances it or when a task with a later time is run.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::config::{NegativeDelayPolicy, SchedulerConfig};
use crate::error::{Error, Result};

/// Monotonically increasing sequence counter for deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// Create the initial sequence value.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the next sequence value, incrementing the counter.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of posted work.
///
/// Clones share the same closure, and identity is what [`Scheduler::remove`]
/// matches on: removing a runnable cancels every pending task created from
/// it or any of its clones.
#[derive(Clone)]
pub struct Runnable(Arc<dyn Fn() + Send + Sync>);

impl Runnable {
    pub fn new(work: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(work))
    }

    pub fn run(&self) {
        (self.0)();
    }

    /// Whether both handles refer to the same work item.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runnable")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Where a task sits relative to others scheduled at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Behind every earlier post for the same instant.
    Ordered,
    /// Ahead of every task already queued for the same instant.
    Front,
}

/// A pending task in the scheduler queue.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Insertion sequence number.
    pub seq: Seq,
    /// Absolute virtual time in milliseconds.
    pub scheduled_time: u64,
    pub placement: Placement,
    pub work: Runnable,
}

impl ScheduledTask {
    #[must_use]
    pub const fn new(seq: Seq, scheduled_time: u64, placement: Placement, work: Runnable) -> Self {
        Self {
            seq,
            scheduled_time,
            placement,
            work,
        }
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled_time == other.scheduled_time
            && self.seq == other.seq
            && self.placement == other.placement
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for the max-heap: the greater task runs first.
        other
            .scheduled_time
            .cmp(&self.scheduled_time)
            .then_with(|| match (self.placement, other.placement) {
                (Placement::Front, Placement::Ordered) => Ordering::Greater,
                (Placement::Ordered, Placement::Front) => Ordering::Less,
                // Latest front post first.
                (Placement::Front, Placement::Front) => self.seq.cmp(&other.seq),
                (Placement::Ordered, Placement::Ordered) => other.seq.cmp(&self.seq),
            })
    }
}

/// How eagerly a scheduler runs posted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdleState {
    /// Nothing runs until the test advances the scheduler.
    Paused,
    /// Due work runs inline; the clock only moves when advanced.
    Unpaused,
    /// All posted work runs inline, carrying the clock forward.
    ConstantIdle,
}

impl IdleState {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paused" | "pause" => Some(Self::Paused),
            "unpaused" | "normal" | "running" => Some(Self::Unpaused),
            "constant-idle" | "constant_idle" | "constant" | "idle-constantly" => {
                Some(Self::ConstantIdle)
            }
            _ => None,
        }
    }
}

impl FromStr for IdleState {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value).ok_or_else(|| Error::config(format!("unknown idle state {value:?}")))
    }
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => f.write_str("paused"),
            Self::Unpaused => f.write_str("unpaused"),
            Self::ConstantIdle => f.write_str("constant-idle"),
        }
    }
}

#[derive(Debug)]
struct SchedulerState {
    queue: BinaryHeap<ScheduledTask>,
    seq: Seq,
    current_time: u64,
    idle_state: IdleState,
    /// Number of tasks of this scheduler currently on the stack.
    executing_depth: usize,
    shut_down: bool,
}

impl SchedulerState {
    const fn next_seq(&mut self) -> Seq {
        let current = self.seq;
        self.seq = self.seq.next();
        current
    }
}

/// The virtual-time task scheduler.
///
/// Shared behind an `Arc` by its dispatcher, its endpoints and the test.
/// User work never runs while the internal lock is held, so tasks may post,
/// remove and advance on their own scheduler.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    associated_thread: ThreadId,
    start_time: u64,
    initial_idle_state: IdleState,
    negative_delay: NegativeDelayPolicy,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler bound to the calling thread with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SchedulerConfig::default())
    }

    /// Create a scheduler bound to the calling thread.
    #[must_use]
    pub fn with_config(config: &SchedulerConfig) -> Self {
        Self::for_thread(thread::current().id(), config)
    }

    /// Create a scheduler bound to `thread`.
    ///
    /// Posts made from any other thread are only queued, never run inline.
    #[must_use]
    pub fn for_thread(thread: ThreadId, config: &SchedulerConfig) -> Self {
        let start_time = config.start_time();
        let initial_idle_state = config.initial_idle_state();
        Self {
            state: Mutex::new(SchedulerState {
                queue: BinaryHeap::new(),
                seq: Seq::zero(),
                current_time: start_time,
                idle_state: initial_idle_state,
                executing_depth: 0,
                shut_down: false,
            }),
            associated_thread: thread,
            start_time,
            initial_idle_state,
            negative_delay: config.negative_delay_policy(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn associated_thread(&self) -> ThreadId {
        self.associated_thread
    }

    /// Current virtual time in milliseconds.
    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.state().current_time
    }

    #[must_use]
    pub fn idle_state(&self) -> IdleState {
        self.state().idle_state
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.idle_state() == IdleState::Paused
    }

    /// Whether the owning dispatcher has quit.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether any pending task is due at the current time.
    #[must_use]
    pub fn are_any_runnable(&self) -> bool {
        let state = self.state();
        state
            .queue
            .peek()
            .is_some_and(|task| task.scheduled_time <= state.current_time)
    }

    /// Time of the task that would run next, if any.
    #[must_use]
    pub fn next_task_time(&self) -> Option<u64> {
        self.state().queue.peek().map(|task| task.scheduled_time)
    }

    /// Latest scheduled time among pending tasks, if any.
    #[must_use]
    pub fn last_task_time(&self) -> Option<u64> {
        self.state()
            .queue
            .iter()
            .map(|task| task.scheduled_time)
            .max()
    }

    /// Post work to run at the current time.
    ///
    /// Returns `false` if the scheduler has shut down and the work was dropped.
    pub fn post(&self, work: Runnable) -> bool {
        self.schedule(work, 0, Placement::Ordered)
    }

    /// Post work to run `delay_ms` after the current time.
    ///
    /// Negative delays are rejected or clamped to zero depending on the
    /// configured [`NegativeDelayPolicy`].
    pub fn post_delayed(&self, work: Runnable, delay_ms: i64) -> Result<bool> {
        let delay = match u64::try_from(delay_ms) {
            Ok(delay) => delay,
            Err(_) => match self.negative_delay {
                NegativeDelayPolicy::Reject => {
                    tracing::debug!(
                        event = "scheduler.post.rejected",
                        delay_ms,
                        "Negative delay rejected"
                    );
                    return Err(Error::NegativeDelay { delay_ms });
                }
                NegativeDelayPolicy::Clamp => {
                    tracing::warn!(
                        event = "scheduler.post.clamped",
                        delay_ms,
                        "Negative delay clamped to zero"
                    );
                    0
                }
            },
        };
        Ok(self.schedule(work, delay, Placement::Ordered))
    }

    /// Post work ahead of everything else due at the current time.
    pub fn post_at_front_of_queue(&self, work: Runnable) -> bool {
        self.schedule(work, 0, Placement::Front)
    }

    fn schedule(&self, work: Runnable, delay_ms: u64, placement: Placement) -> bool {
        let drain = {
            let mut state = self.state();
            if state.shut_down {
                tracing::trace!(
                    event = "scheduler.post.dropped",
                    delay_ms,
                    "Post after shutdown dropped"
                );
                return false;
            }

            let scheduled_time = state.current_time.saturating_add(delay_ms);
            let seq = state.next_seq();
            state
                .queue
                .push(ScheduledTask::new(seq, scheduled_time, placement, work));

            tracing::trace!(
                event = "scheduler.post",
                delay_ms,
                scheduled_time,
                ?placement,
                %seq,
                "Task posted"
            );

            // Nested posts are picked up by the drain already running.
            let inline = state.executing_depth == 0
                && thread::current().id() == self.associated_thread;
            if inline { Some(state.idle_state) } else { None }
        };

        match drain {
            Some(IdleState::Unpaused) => {
                self.advance_by(0);
            }
            Some(IdleState::ConstantIdle) => {
                self.run_until_empty();
            }
            Some(IdleState::Paused) | None => {}
        }
        true
    }

    /// Remove every pending task created from `work`.
    pub fn remove(&self, work: &Runnable) {
        let mut state = self.state();
        let before = state.queue.len();
        state.queue.retain(|task| !task.work.ptr_eq(work));
        let removed = before - state.queue.len();
        tracing::trace!(event = "scheduler.remove", removed, "Tasks removed");
    }

    /// Run everything due within the next `interval_ms`, then move the clock
    /// to the end of the interval. `advance_by(0)` is the idle operation.
    ///
    /// Returns true if any task ran.
    pub fn advance_by(&self, interval_ms: u64) -> bool {
        let end_time = self.current_time().saturating_add(interval_ms);
        self.advance_to(end_time)
    }

    /// Run everything scheduled at or before `end_time`, then move the clock
    /// to `end_time` (never backwards).
    ///
    /// Returns true if any task ran.
    pub fn advance_to(&self, end_time: u64) -> bool {
        if self.is_shut_down() {
            return false;
        }

        let mut run_count = 0_usize;
        while let Some(task) = self.pop_due(Some(end_time)) {
            self.execute(task);
            run_count += 1;
        }

        let mut state = self.state();
        if end_time > state.current_time {
            state.current_time = end_time;
        }
        tracing::trace!(
            event = "scheduler.advance",
            end_time,
            run_count,
            current_time = state.current_time,
            "Advanced clock"
        );
        run_count > 0
    }

    /// Move the clock to the earliest pending task and run every task
    /// scheduled for that instant.
    pub fn advance_to_next_posted_runnable(&self) -> bool {
        self.next_task_time()
            .is_some_and(|next| self.advance_to(next))
    }

    /// Run every pending task, moving the clock to the latest one.
    pub fn advance_to_last_posted_runnable(&self) -> bool {
        self.last_task_time()
            .is_some_and(|last| self.advance_to(last))
    }

    /// Keep running to the last posted task until nothing is left, so work
    /// posted later than the previous target by a running task still runs.
    fn run_until_empty(&self) {
        while self.advance_to_last_posted_runnable() {}
    }

    /// Run exactly one task, the earliest pending one.
    ///
    /// Returns false if the queue was empty.
    pub fn run_one_task(&self) -> bool {
        match self.pop_due(None) {
            Some(task) => {
                self.execute(task);
                true
            }
            None => false,
        }
    }

    /// Pop the next task if it is scheduled no later than `limit`.
    ///
    /// The clock moves to the task's time and the executing depth is raised
    /// under the same lock, so posts made by the task only queue.
    fn pop_due(&self, limit: Option<u64>) -> Option<ScheduledTask> {
        let mut state = self.state();
        if state.shut_down {
            return None;
        }
        let due = state
            .queue
            .peek()
            .is_some_and(|task| limit.is_none_or(|limit| task.scheduled_time <= limit));
        if !due {
            return None;
        }
        let task = state.queue.pop()?;
        if task.scheduled_time > state.current_time {
            state.current_time = task.scheduled_time;
        }
        state.executing_depth += 1;
        Some(task)
    }

    fn execute(&self, task: ScheduledTask) {
        let _executing = ExecutingGuard { scheduler: self };
        tracing::trace!(
            event = "scheduler.task.run",
            seq = %task.seq,
            scheduled_time = task.scheduled_time,
            "Running task"
        );
        task.work.run();
    }

    /// Switch idle state, running whatever the new state requires.
    ///
    /// Entering `Unpaused` runs everything already due; entering
    /// `ConstantIdle` runs everything pending.
    pub fn set_idle_state(&self, idle_state: IdleState) {
        {
            let mut state = self.state();
            tracing::debug!(
                event = "scheduler.idle_state",
                from = %state.idle_state,
                to = %idle_state,
                "Idle state changed"
            );
            state.idle_state = idle_state;
        }
        match idle_state {
            IdleState::Unpaused => {
                self.advance_by(0);
            }
            IdleState::ConstantIdle => {
                self.run_until_empty();
            }
            IdleState::Paused => {}
        }
    }

    pub fn pause(&self) {
        self.set_idle_state(IdleState::Paused);
    }

    /// Resume automatic execution, catching up on everything already due.
    pub fn unpause(&self) {
        self.set_idle_state(IdleState::Unpaused);
    }

    /// Pause or unpause, returning whether the scheduler was paused before.
    pub fn set_paused(&self, paused: bool) -> bool {
        let was_paused = self.is_paused();
        if paused {
            self.pause();
        } else {
            self.unpause();
        }
        was_paused
    }

    pub fn idle_constantly(&self, constantly: bool) {
        self.set_idle_state(if constantly {
            IdleState::ConstantIdle
        } else {
            IdleState::Unpaused
        });
    }

    /// Run `f` with the scheduler paused; unpause afterwards unless it was
    /// already paused.
    pub fn run_paused<R>(&self, f: impl FnOnce() -> R) -> R {
        let was_paused = self.set_paused(true);
        let _restore = (!was_paused).then_some(UnpauseGuard { scheduler: self });
        f()
    }

    /// Drop all pending work and restore the starting clock and idle state.
    pub fn reset(&self) {
        let mut state = self.state();
        let dropped = state.queue.len();
        state.queue.clear();
        state.current_time = self.start_time;
        state.idle_state = self.initial_idle_state;
        state.executing_depth = 0;
        tracing::debug!(event = "scheduler.reset", dropped, "Scheduler reset");
    }

    /// Refuse all further posts and drop pending work.
    pub(crate) fn shut_down(&self) {
        let mut state = self.state();
        state.shut_down = true;
        state.queue.clear();
        tracing::debug!(event = "scheduler.shutdown", "Scheduler shut down");
    }

    /// Accept posts again after a dispatcher reset.
    pub(crate) fn reopen(&self) {
        self.state().shut_down = false;
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Scheduler")
            .field("current_time", &state.current_time)
            .field("idle_state", &state.idle_state)
            .field("queue_len", &state.queue.len())
            .field("seq", &state.seq)
            .field("shut_down", &state.shut_down)
            .field("associated_thread", &self.associated_thread)
            .finish_non_exhaustive()
    }
}

struct ExecutingGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.scheduler.state();
        state.executing_depth = state.executing_depth.saturating_sub(1);
    }
}

/// Leaves [`Scheduler::run_paused`] unpaused again.
struct UnpauseGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for UnpauseGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            // Restore the state only; held work waits for the next drain.
            self.scheduler.state().idle_state = IdleState::Unpaused;
        } else {
            self.scheduler.unpause();
        }
    }
}

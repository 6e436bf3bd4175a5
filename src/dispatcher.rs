//! Per-thread run loops and the registry that resolves them.
//!
//! A [`Dispatcher`] owns one [`Scheduler`] and stands in for a thread's run
//! loop. The main dispatcher is never quit and is reset in place between
//! tests; worker dispatchers park their thread in [`Dispatcher::run_loop`]
//! until another thread quits them.
//!
//! [`DispatcherRegistry`] is the explicit replacement for ambient per-thread
//! globals: tests own one, inject it where needed, and tear it down with
//! [`DispatcherRegistry::reset`].

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::scheduler::{Runnable, Scheduler};

/// Simulated run loop bound to one thread.
#[derive(Debug)]
pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    bound_thread: ThreadId,
    is_main: bool,
    quit: Mutex<bool>,
    quit_signal: Condvar,
}

impl Dispatcher {
    /// Create the main-thread dispatcher.
    #[must_use]
    pub fn new_main(thread: ThreadId, config: &SchedulerConfig) -> Self {
        Self::new(thread, true, config)
    }

    /// Create a dispatcher for a background thread.
    #[must_use]
    pub fn new_worker(thread: ThreadId, config: &SchedulerConfig) -> Self {
        Self::new(thread, false, config)
    }

    fn new(thread: ThreadId, is_main: bool, config: &SchedulerConfig) -> Self {
        tracing::debug!(
            event = "dispatcher.create",
            thread = ?thread,
            is_main,
            "Dispatcher created"
        );
        Self {
            scheduler: Arc::new(Scheduler::for_thread(thread, config)),
            bound_thread: thread,
            is_main,
            quit: Mutex::new(false),
            quit_signal: Condvar::new(),
        }
    }

    fn quit_flag(&self) -> MutexGuard<'_, bool> {
        self.quit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub const fn bound_thread(&self) -> ThreadId {
        self.bound_thread
    }

    #[must_use]
    pub const fn is_main(&self) -> bool {
        self.is_main
    }

    #[must_use]
    pub fn has_quit(&self) -> bool {
        *self.quit_flag()
    }

    /// Stop this run loop: pending work is dropped, later posts are refused
    /// and any thread parked in [`run_loop`](Self::run_loop) returns.
    ///
    /// The main dispatcher cannot be quit.
    pub fn quit(&self) -> Result<()> {
        if self.is_main {
            tracing::error!(
                event = "dispatcher.quit.rejected",
                thread = ?self.bound_thread,
                "Main dispatcher quit attempted"
            );
            return Err(Error::MainThreadQuit);
        }
        self.quit_unchecked();
        Ok(())
    }

    /// Same as [`quit`](Self::quit); pending work is dropped either way.
    pub fn quit_safely(&self) -> Result<()> {
        self.quit()
    }

    /// Quit without the main-dispatcher check.
    pub fn quit_unchecked(&self) {
        let mut quit = self.quit_flag();
        *quit = true;
        self.scheduler.shut_down();
        self.quit_signal.notify_all();
        tracing::debug!(
            event = "dispatcher.quit",
            thread = ?self.bound_thread,
            "Dispatcher quit"
        );
    }

    /// Run the loop "forever".
    ///
    /// The main dispatcher returns at once; its work is driven by the test.
    /// A worker dispatcher blocks the calling thread until it is quit.
    pub fn run_loop(&self) {
        if self.is_main {
            return;
        }
        let mut quit = self.quit_flag();
        tracing::trace!(
            event = "dispatcher.loop.park",
            thread = ?self.bound_thread,
            "Parking in run loop"
        );
        while !*quit {
            quit = self
                .quit_signal
                .wait(quit)
                .unwrap_or_else(PoisonError::into_inner);
        }
        tracing::trace!(
            event = "dispatcher.loop.exit",
            thread = ?self.bound_thread,
            "Run loop exited"
        );
    }

    /// Clear pending work, restore the scheduler's start state and undo a
    /// previous quit.
    pub fn reset(&self) {
        let mut quit = self.quit_flag();
        self.scheduler.reset();
        self.scheduler.reopen();
        *quit = false;
    }

    /// Returns `false` once the dispatcher has quit.
    pub fn post(&self, work: Runnable) -> bool {
        !self.has_quit() && self.scheduler.post(work)
    }

    pub fn post_delayed(&self, work: Runnable, delay_ms: i64) -> Result<bool> {
        if self.has_quit() {
            return Ok(false);
        }
        self.scheduler.post_delayed(work, delay_ms)
    }

    pub fn post_at_front_of_queue(&self, work: Runnable) -> bool {
        !self.has_quit() && self.scheduler.post_at_front_of_queue(work)
    }

    /// Run tasks that are already due without moving the clock.
    pub fn idle(&self) -> bool {
        self.scheduler.advance_by(0)
    }

    /// Run tasks due within the next `interval_ms`, advancing the clock.
    pub fn idle_for(&self, interval_ms: u64) -> bool {
        self.scheduler.advance_by(interval_ms)
    }

    pub fn run_to_end_of_tasks(&self) -> bool {
        self.scheduler.advance_to_last_posted_runnable()
    }

    pub fn run_to_next_task(&self) -> bool {
        self.scheduler.advance_to_next_posted_runnable()
    }

    pub fn run_one_task(&self) -> bool {
        self.scheduler.run_one_task()
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn unpause(&self) {
        self.scheduler.unpause();
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub fn set_paused(&self, paused: bool) -> bool {
        self.scheduler.set_paused(paused)
    }

    pub fn idle_constantly(&self, constantly: bool) {
        self.scheduler.idle_constantly(constantly);
    }
}

/// Registry mapping threads to their dispatchers.
#[derive(Debug)]
pub struct DispatcherRegistry {
    config: SchedulerConfig,
    main: Arc<Dispatcher>,
    workers: Mutex<HashMap<ThreadId, Arc<Dispatcher>>>,
}

impl DispatcherRegistry {
    /// Create a registry whose main dispatcher is bound to the calling thread.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_main_thread(thread::current().id(), config)
    }

    #[must_use]
    pub fn with_main_thread(main_thread: ThreadId, config: SchedulerConfig) -> Self {
        let main = Arc::new(Dispatcher::new_main(main_thread, &config));
        Self {
            config,
            main,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<Dispatcher>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn main(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.main)
    }

    #[must_use]
    pub fn main_thread(&self) -> ThreadId {
        self.main.bound_thread()
    }

    #[must_use]
    pub fn is_main_thread(&self, thread: ThreadId) -> bool {
        thread == self.main_thread()
    }

    /// The dispatcher for `thread`, created on first use.
    pub fn for_thread(&self, thread: ThreadId) -> Arc<Dispatcher> {
        if self.is_main_thread(thread) {
            return self.main();
        }
        let mut workers = self.workers();
        Arc::clone(
            workers
                .entry(thread)
                .or_insert_with(|| Arc::new(Dispatcher::new_worker(thread, &self.config))),
        )
    }

    /// The dispatcher for the calling thread.
    pub fn current(&self) -> Arc<Dispatcher> {
        self.for_thread(thread::current().id())
    }

    /// The dispatcher for `thread`, if one exists.
    #[must_use]
    pub fn get(&self, thread: ThreadId) -> Option<Arc<Dispatcher>> {
        if self.is_main_thread(thread) {
            return Some(self.main());
        }
        self.workers().get(&thread).cloned()
    }

    /// Drop the registry's handle to a worker thread's dispatcher.
    pub fn forget_thread(&self, thread: ThreadId) -> Option<Arc<Dispatcher>> {
        self.workers().remove(&thread)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers().len()
    }

    /// Tear down everything a test left behind.
    ///
    /// Worker dispatchers are quit (or, if already quit, have their
    /// scheduler reset) and forgotten. The main dispatcher is reset in place
    /// so existing handles to it stay valid. Must be called from the main
    /// thread.
    pub fn reset(&self) -> Result<()> {
        let main_thread = self.main_thread();
        if thread::current().id() != main_thread {
            return Err(Error::wrong_thread(main_thread));
        }

        let workers: Vec<Arc<Dispatcher>> = self.workers().drain().map(|(_, d)| d).collect();
        for dispatcher in &workers {
            if dispatcher.has_quit() {
                dispatcher.scheduler().reset();
            } else {
                dispatcher.quit_unchecked();
            }
        }
        self.main.reset();

        tracing::debug!(
            event = "registry.reset",
            workers = workers.len(),
            "Dispatcher registry reset"
        );
        Ok(())
    }
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

use crate::context;
use crate::error::Error;
use crate::runtime::scheduler::{self, Scheduler, WaitPoll};
use crate::runtime::wait::{SleepWait, WaitStrategy};
use crate::stack::{self, MIN_STACK_SIZE};
use crate::time::{Clock, MonotonicClock};
use std::panic;
use std::time::Duration;
use tracing::{debug, warn};

/// Stack size used by [`spawn`](crate::spawn) unless overridden.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Idle re-check interval: how long the wait step sleeps per retry when the
/// clock still reads earlier than a deadline it has already slept to.
pub const WAIT_QUANTUM: Duration = Duration::from_millis(5);

/// Configures and installs a [`Runtime`] on the current thread.
#[derive(Debug)]
pub struct Builder {
    default_stack_size: usize,
    wait_quantum: Duration,
    clock: Box<dyn Clock>,
    wait: Box<dyn WaitStrategy>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            wait_quantum: WAIT_QUANTUM,
            clock: Box::new(MonotonicClock::new()),
            wait: Box::new(SleepWait),
        }
    }

    /// Stack size for tasks spawned without an explicit size.
    ///
    /// # Panics
    ///
    /// If `size` is not a power of two of at least
    /// [`MIN_STACK_SIZE`](crate::MIN_STACK_SIZE).
    #[track_caller]
    pub fn default_stack_size(mut self, size: usize) -> Self {
        assert!(
            size.is_power_of_two() && size >= MIN_STACK_SIZE,
            "stack size must be a power of two of at least {MIN_STACK_SIZE} bytes, got {size}"
        );
        self.default_stack_size = size;
        self
    }

    /// Re-check interval for the wait step when the clock lags behind a
    /// pending deadline.
    ///
    /// # Panics
    ///
    /// If `quantum` is zero.
    #[track_caller]
    pub fn wait_quantum(mut self, quantum: Duration) -> Self {
        assert!(!quantum.is_zero(), "wait quantum must be non-zero");
        self.wait_quantum = quantum;
        self
    }

    /// Substitute the time source; tests use this to make timers fire
    /// deterministically.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Substitute the idle-wait strategy.
    pub fn wait_strategy(mut self, wait: impl WaitStrategy) -> Self {
        self.wait = Box::new(wait);
        self
    }

    /// Install the runtime on this thread.
    ///
    /// Fails with [`Error::RuntimeActive`] if another runtime is already
    /// installed here.
    pub fn try_build(self) -> Result<Runtime, Error> {
        context::install(Scheduler::new(self.default_stack_size, self.clock))?;
        debug!(
            default_stack_size = self.default_stack_size,
            quantum_ms = self.wait_quantum.as_millis() as u64,
            "runtime installed"
        );
        Ok(Runtime {
            wait: self.wait,
            wait_quantum: self.wait_quantum,
        })
    }
}

/// A single-threaded cooperative runtime.
///
/// Owns the main loop; the scheduler itself lives in the thread-local
/// context so that task-side operations ([`yield_now`](crate::yield_now),
/// [`sleep_for`](crate::sleep_for), [`spawn`](crate::spawn)) can reach it
/// without threading a handle through every call. Dropping the runtime
/// tears the context down and releases every remaining task.
#[derive(Debug)]
pub struct Runtime {
    wait: Box<dyn WaitStrategy>,
    wait_quantum: Duration,
}

impl Runtime {
    /// [`spawn`](crate::spawn), as a method for use before `run`.
    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> Result<(), Error>
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        scheduler::spawn(name, body)
    }

    /// Drive tasks until none remain or the runtime halts.
    ///
    /// Repeatedly dispatches the head of the ready queue; when nothing is
    /// ready, blocks until the nearest timer fires and promotes expired
    /// sleepers. Returns once every task has finished.
    ///
    /// A task returning `Err` stops the loop immediately with
    /// [`Error::TaskFailed`]; remaining tasks stay suspended until the
    /// runtime is dropped. A panicking task's panic resumes here, on the
    /// caller's stack. If at some point every remaining task is sleeping
    /// indefinitely with nothing left to wake it, the loop halts with
    /// [`Error::TasksLeaked`] rather than hanging.
    pub fn run(&mut self) -> Result<(), Error> {
        debug!(tasks = context::with_sched(|s| s.live_tasks()), "run started");
        loop {
            if !context::with_sched(|s| s.has_ready()) {
                if context::with_sched(|s| s.live_tasks()) == 0 {
                    break;
                }
                match self.wait_step()? {
                    WaitPoll::Ready => {}
                    WaitPoll::NoTimers => break,
                    WaitPoll::TimerPending => unreachable!("wait_step loops on pending timers"),
                }
            }

            let Some(id) = context::with_sched(|s| s.ready_head()) else {
                continue;
            };
            let (save, restore) = context::with_sched_mut(|s| s.begin_dispatch(id));

            // Safety: both pointers come from the installed scheduler and
            // the borrow is released. The scheduler never moves while
            // installed and the task record stays put until reaped, which
            // only happens after control returns here.
            unsafe { stack::switch(save, restore) };

            let completion = context::with_sched_mut(|s| s.after_switch());
            if let Some(payload) = completion.panic {
                panic::resume_unwind(payload);
            }
            if let Some((name, source)) = completion.failure {
                debug!(task = %name, error = %source, "task failed");
                return Err(Error::TaskFailed { name, source });
            }
        }

        match context::with_sched(|s| s.live_tasks()) {
            0 => {
                debug!("run finished");
                Ok(())
            }
            count => {
                warn!(count, "halting with leaked tasks");
                Err(Error::TasksLeaked { count })
            }
        }
    }

    /// Block until at least one sleeper can be promoted: one sleep until the
    /// nearest deadline, then quantum-sized re-checks for as long as the
    /// clock still reads earlier than that deadline.
    fn wait_step(&mut self) -> Result<WaitPoll, Error> {
        let timeout = match context::with_sched(|s| s.next_wait_timeout())? {
            Some(timeout) => timeout,
            // Only indefinite sleepers left; nothing will ever fire.
            None => return Ok(WaitPoll::NoTimers),
        };
        self.wait.wait(timeout);

        loop {
            match context::with_sched_mut(|s| s.promote_expired())? {
                WaitPoll::TimerPending => self.wait.wait(self.wait_quantum),
                poll => return Ok(poll),
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        context::teardown();
    }
}

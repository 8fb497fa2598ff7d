use crate::context;
use crate::error::Error;
use crate::runtime::queue::TaskQueue;
use crate::stack::{self, Registers, Stack};
use crate::task::{Task, TaskBody, TaskFlags, TaskId};
use crate::time::Clock;
#[allow(unused)]
use crate::utils::tracker::{Call, Method, Tracker};
use slab::Slab;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::trace;

const NOT_INSIDE_TASK: &str = "task-only operation called outside of a running task";

/// What the wait step learned from a promotion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitPoll {
    /// At least one task is ready to dispatch.
    Ready,

    /// Nothing ready yet, but a timed sleeper still has a pending deadline.
    TimerPending,

    /// Only indefinite sleepers remain; no timer can ever fire. The main
    /// loop halts and reports them as leaked instead of hanging.
    NoTimers,
}

/// Outcome of one dispatch, taken out of the task record after the switch
/// back. Panic payloads are resumed and failures returned only once the
/// scheduler is back on its own stack; nothing ever unwinds across a switch.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub(crate) panic: Option<Box<dyn std::any::Any + Send>>,
    pub(crate) failure: Option<(String, anyhow::Error)>,
}

/// The scheduler core: task arena, ready/sleeping queues, current task,
/// live count and the scheduler-side execution context.
///
/// Owned by the `Runtime` through the thread-local context; all state is
/// mutated only while control is inside the scheduler's own code, so no
/// locking exists anywhere.
#[derive(Debug)]
pub(crate) struct Scheduler {
    tasks: Slab<Task>,

    /// Tasks eligible to run, strict FIFO.
    ready: TaskQueue,

    /// Tasks waiting on a timer or an explicit wake; timed members sorted
    /// ascending by wake time, indefinite members trailing.
    sleeping: TaskQueue,

    /// Set while a task's stack is executing, `None` when the scheduler
    /// itself is in control.
    current: Option<TaskId>,

    /// Live records; non-zero at halt means tasks were leaked.
    live: usize,

    /// Where `transfer` parks a task's registers to resume the main loop.
    sched_regs: Registers,

    clock: Box<dyn Clock>,

    default_stack_size: usize,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Scheduler {
    pub(crate) fn new(default_stack_size: usize, clock: Box<dyn Clock>) -> Self {
        Self {
            tasks: Slab::new(),
            ready: TaskQueue::new(),
            sleeping: TaskQueue::new(),
            current: None,
            live: 0,
            sched_regs: Registers::default(),
            clock,
            default_stack_size,

            #[cfg(test)]
            tracker: Tracker::new(),
        }
    }

    // No-op in release builds.
    #[allow(unused)]
    #[inline(always)]
    fn track(&self, method: Method, call: Call) {
        #[cfg(test)]
        self.tracker.record(method, call);
    }

    /// Register a new task: map its stack, prime its context suspended at
    /// the entry shim, and append it to the ready queue. Never switches
    /// stacks, so spawning is safe at any point, including from inside a
    /// running task.
    pub(crate) fn spawn(
        &mut self,
        name: String,
        stack_size: usize,
        body: TaskBody,
    ) -> Result<TaskId, Error> {
        let stack = Stack::map(stack_size)?;

        let entry = self.tasks.vacant_entry();
        let id = TaskId(entry.key());
        let regs = Registers::primed(&stack, task_entry, id.as_usize());
        entry.insert(Task::new(name, body, stack, regs));

        self.tasks[id.as_usize()].flags.insert(TaskFlags::READY);
        self.ready.push_back(&mut self.tasks, id);
        self.live += 1;

        trace!(task = %id, name = %self.tasks[id.as_usize()].name, "spawned");
        self.track(
            Method::Spawn,
            Call::Spawn {
                id,
                name: self.tasks[id.as_usize()].name.clone(),
            },
        );
        Ok(id)
    }

    /// Idempotent wake: clear the wake time and, unless the task is already
    /// ready, move it from the sleeping queue to the ready tail. This is the
    /// only path by which a sleeping or blocked task becomes runnable again.
    pub(crate) fn make_ready(&mut self, id: TaskId) {
        debug_assert!(self.tasks.contains(id.as_usize()), "stale task handle");

        let task = &mut self.tasks[id.as_usize()];
        task.wake_at = None;

        let was_ready = task.is_ready();
        if !was_ready {
            self.sleeping.remove(&mut self.tasks, id);
            self.tasks[id.as_usize()].flags.insert(TaskFlags::READY);
            self.ready.push_back(&mut self.tasks, id);
            trace!(task = %id, "ready");
        }

        self.track(Method::MakeReady, Call::MakeReady { id, was_ready });
    }

    /// Arm a timeout for `task` and park the *currently running* task in the
    /// sleeping queue at the position `task`'s wake time dictates.
    ///
    /// The asymmetry is deliberate: the timeout parameters describe when
    /// some task becomes eligible again, while the suspension always applies
    /// to the caller. It is what lets a mutex park the blocking task
    /// indefinitely while a different task wakes it later. In-crate the two
    /// are always the same task.
    pub(crate) fn arm_timeout(
        &mut self,
        task: TaskId,
        ms: Option<u64>,
    ) -> Result<Option<u64>, Error> {
        let wake_at = match ms {
            Some(ms) => Some(self.clock.now_ms()?.saturating_add(ms)),
            None => None,
        };
        self.park_current_at(task, wake_at);
        Ok(wake_at)
    }

    /// Infallible core of `arm_timeout`; `wake_at == None` means sleeping
    /// until explicitly woken.
    pub(crate) fn park_current_at(&mut self, task: TaskId, wake_at: Option<u64>) {
        self.tasks[task.as_usize()].wake_at = wake_at;

        let current = self.current.expect(NOT_INSIDE_TASK);
        self.sleeping.insert_by_wake(&mut self.tasks, current, wake_at);

        trace!(task = %current, ?wake_at, "sleeping");
        self.track(
            Method::Sleep,
            Call::Sleep {
                id: current,
                wake_at,
            },
        );
    }

    // --- Main loop support ---

    pub(crate) fn ready_head(&self) -> Option<TaskId> {
        self.ready.head()
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.live
    }

    /// Time until the nearest timer fires, zero if it already expired, or
    /// `None` when only indefinite sleepers exist (sorted order guarantees a
    /// timed head whenever there is any timed sleeper).
    pub(crate) fn next_wait_timeout(&self) -> Result<Option<Duration>, Error> {
        let Some(head) = self.sleeping.head() else {
            return Ok(None);
        };
        match self.tasks[head.as_usize()].wake_at {
            Some(wake_at) => {
                let now = self.clock.now_ms()?;
                Ok(Some(Duration::from_millis(wake_at.saturating_sub(now))))
            }
            None => Ok(None),
        }
    }

    /// Promote every timed sleeper whose deadline has elapsed, then report
    /// what the main loop should do next.
    pub(crate) fn promote_expired(&mut self) -> Result<WaitPoll, Error> {
        let now = self.clock.now_ms()?;

        while let Some(head) = self.sleeping.head() {
            match self.tasks[head.as_usize()].wake_at {
                Some(wake_at) if now >= wake_at => self.make_ready(head),
                _ => break,
            }
        }

        if self.has_ready() {
            Ok(WaitPoll::Ready)
        } else {
            match self.sleeping.head() {
                Some(head) if self.tasks[head.as_usize()].wake_at.is_some() => {
                    Ok(WaitPoll::TimerPending)
                }
                _ => Ok(WaitPoll::NoTimers),
            }
        }
    }

    /// Pop `id` off the ready queue and mark it current. Returns the
    /// (save, restore) register pointers for the switch; the thread-local
    /// borrow must be released before switching.
    pub(crate) fn begin_dispatch(&mut self, id: TaskId) -> (*mut Registers, *const Registers) {
        self.tasks[id.as_usize()].flags.remove(TaskFlags::READY);
        self.ready.remove(&mut self.tasks, id);
        self.current = Some(id);

        trace!(task = %id, name = %self.tasks[id.as_usize()].name, "dispatch");
        self.track(Method::Dispatch, Call::Dispatch { id });

        let save = &mut self.sched_regs as *mut Registers;
        let restore = &self.tasks[id.as_usize()].regs as *const Registers;
        (save, restore)
    }

    /// Inspect the dispatched task after it handed control back: collect its
    /// captured outcome and reap it if done (stack and record released
    /// together). Clears `current` either way.
    pub(crate) fn after_switch(&mut self) -> Completion {
        let id = self.current.take().expect("after_switch without a dispatch");
        let task = &mut self.tasks[id.as_usize()];

        let completion = Completion {
            panic: task.panic.take(),
            failure: task.failure.take().map(|e| (task.name.clone(), e)),
        };

        if task.is_done() {
            self.live -= 1;
            let task = self.tasks.remove(id.as_usize());
            trace!(task = %id, name = %task.name, "reaped");
            self.track(Method::Reap, Call::Reap { id });
        }

        completion
    }

    // --- Task-side support ---

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    #[track_caller]
    pub(crate) fn current_or_panic(&self) -> TaskId {
        self.current.expect(NOT_INSIDE_TASK)
    }

    pub(crate) fn current_name(&self) -> Option<String> {
        self.current
            .map(|id| self.tasks[id.as_usize()].name.clone())
    }

    pub(crate) fn now_ms(&self) -> Result<u64, Error> {
        self.clock.now_ms()
    }

    pub(crate) fn default_stack_size(&self) -> usize {
        self.default_stack_size
    }

    fn take_body(&mut self, id: TaskId) -> TaskBody {
        self.tasks[id.as_usize()]
            .body
            .take()
            .expect("task body already taken")
    }

    fn finish(&mut self, id: TaskId, outcome: Result<anyhow::Result<()>, Box<dyn std::any::Any + Send>>) {
        let task = &mut self.tasks[id.as_usize()];
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => task.failure = Some(err),
            Err(payload) => task.panic = Some(payload),
        }
        task.flags.insert(TaskFlags::DONE);
    }

    /// Write current/ready/sleeping task names to stderr. Debugging aid,
    /// not a stable format.
    pub(crate) fn dump(&self) {
        let names = |q: &TaskQueue| {
            q.iter(&self.tasks)
                .map(|id| self.tasks[id.as_usize()].name.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };

        eprintln!(">>>");
        eprintln!(
            "Current task: {}",
            self.current_name().unwrap_or_else(|| "<scheduler>".into())
        );
        eprintln!("Ready tasks: {}", names(&self.ready));
        eprintln!("Sleeping tasks: {}", names(&self.sleeping));
    }

    /// Ready-queue traversal for test assertions.
    #[cfg(test)]
    pub(crate) fn ready_order(&self) -> Vec<TaskId> {
        self.ready.iter(&self.tasks).collect()
    }
}

/// Hand control from the running task back to the scheduler's context.
pub(crate) fn transfer() {
    let (save, restore) = context::with_sched_mut(|s| {
        let id = s.current.expect(NOT_INSIDE_TASK);
        (
            &mut s.tasks[id.as_usize()].regs as *mut Registers,
            &s.sched_regs as *const Registers,
        )
    });

    // Safety: both pointers were derived from the installed scheduler just
    // above and the borrow is released; single-threaded, so nothing touches
    // either context until the switch completes.
    unsafe { stack::switch(save, restore) };
}

/// First and only frame on every task stack.
///
/// Takes the body out of the record, runs it with panics contained, stores
/// the outcome, marks the task done and hands control back to the scheduler
/// permanently. A done task is never resumed; the trailing loop only guards
/// the impossible.
extern "C" fn task_entry(raw: usize) -> ! {
    let id = TaskId(raw);

    let body = context::with_sched_mut(|s| s.take_body(id));
    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    context::with_sched_mut(|s| s.finish(id, outcome));

    loop {
        transfer();
    }
}

// --- Public task-facing API ---

/// Register a coroutine under `name` with the runtime's default stack size.
///
/// The body runs cooperatively once the main loop dispatches it; an `Err` it
/// returns surfaces out of [`Runtime::run`](crate::Runtime::run) as
/// [`Error::TaskFailed`]. Callable before `run` and from inside tasks.
pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<(), Error>
where
    F: FnOnce() -> anyhow::Result<()> + 'static,
{
    context::with_sched_mut(|s| {
        let stack_size = s.default_stack_size();
        s.spawn(name.into(), stack_size, Box::new(body))
    })
    .map(|_| ())
}

/// [`spawn`] with an explicit stack size (rounded up to whole pages).
pub fn spawn_with_stack_size<F>(
    name: impl Into<String>,
    stack_size: usize,
    body: F,
) -> Result<(), Error>
where
    F: FnOnce() -> anyhow::Result<()> + 'static,
{
    context::with_sched_mut(|s| s.spawn(name.into(), stack_size, Box::new(body))).map(|_| ())
}

/// Re-enqueue the current task at the ready tail and run something else:
/// everything currently ready gets a turn before the caller resumes.
///
/// # Panics
///
/// Outside of a running task.
pub fn yield_now() {
    context::with_sched_mut(|s| {
        let id = s.current_or_panic();
        s.track(Method::Yield, Call::Yield { id });
        s.make_ready(id);
    });
    transfer();
}

/// Sleep the current task for at least `ms` milliseconds.
///
/// Returns the actual elapsed time, which may exceed `ms` by scheduling
/// latency but is never less. Fails only if the clock does.
///
/// # Panics
///
/// Outside of a running task.
pub fn sleep_for(ms: u64) -> Result<u64, Error> {
    let wake_at = context::with_sched_mut(|s| {
        let id = s.current_or_panic();
        s.arm_timeout(id, Some(ms))
    })?;

    transfer();

    let now = context::with_sched(|s| s.now_ms())?;
    let armed_at = wake_at.expect("timed sleep always has a wake time") - ms;
    Ok(now.saturating_sub(armed_at))
}

/// True when called from inside a running task on an active runtime.
pub fn is_inside_task() -> bool {
    context::is_installed() && context::with_sched(|s| s.current().is_some())
}

/// Panic unless called from inside a running task. Guards operations that
/// only make sense on a task's own stack.
#[track_caller]
pub fn require_inside_task() {
    context::with_sched(|s| {
        s.current_or_panic();
    });
}

/// Name of the currently running task, if any.
pub fn current_task_name() -> Option<String> {
    if !context::is_installed() {
        return None;
    }
    context::with_sched(|s| s.current_name())
}

/// Dump current/ready/sleeping task names to stderr.
pub fn dump_tasks() {
    context::with_sched(|s| s.dump());
}

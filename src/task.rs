use crate::stack::{Registers, Stack};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;

/// A task body runs once on its own stack. An `Err` is captured into the
/// task record and re-surfaced out of `run`, never across a stack switch.
pub(crate) type TaskBody = Box<dyn FnOnce() -> anyhow::Result<()> + 'static>;

/// Stable handle of a task in the scheduler's arena.
///
/// Handles are arena indices: they may be reused after the task is reaped,
/// so holding on to the id of a finished task is a logic bug. Everything
/// that can legally be woken (sleepers, mutex waiters) is still live.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub(crate) fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u8 {
        /// Member of the ready queue.
        const READY = 1;

        /// Body returned or raised; the record is reaped at the next
        /// dispatch boundary.
        const DONE = 1 << 1;
    }
}

/// One coroutine: identity, body, timing state, completion state, queue
/// links, and its execution context (stack + parked registers).
///
/// Queue membership invariant: a task sits in at most one queue at any
/// instant; `prev`/`next` are meaningful only while linked and both `None`
/// otherwise.
pub(crate) struct Task {
    /// Diagnostic only; never used for identity.
    pub(crate) name: String,

    /// Taken out exactly once by the entry shim on first dispatch.
    pub(crate) body: Option<TaskBody>,

    /// Absolute wake time in clock ms while sleeping. `None` means sleeping
    /// indefinitely on a condition, not "already expired".
    pub(crate) wake_at: Option<u64>,

    pub(crate) flags: TaskFlags,

    /// Error the body returned, if any. Surfaced by the dispatcher.
    pub(crate) failure: Option<anyhow::Error>,

    /// Panic payload captured by the entry shim, resumed by the dispatcher.
    pub(crate) panic: Option<Box<dyn Any + Send>>,

    // Queue links (arena indices).
    pub(crate) prev: Option<TaskId>,
    pub(crate) next: Option<TaskId>,

    /// Execution context. The stack and the record are released together
    /// when the dispatcher reaps the task.
    pub(crate) stack: Stack,
    pub(crate) regs: Registers,
}

impl Task {
    pub(crate) fn new(name: String, body: TaskBody, stack: Stack, regs: Registers) -> Self {
        Self {
            name,
            body: Some(body),
            wake_at: None,
            flags: TaskFlags::empty(),
            failure: None,
            panic: None,
            prev: None,
            next: None,
            stack,
            regs,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.flags.contains(TaskFlags::READY)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.flags.contains(TaskFlags::DONE)
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("wake_at", &self.wake_at)
            .field("flags", &self.flags)
            .field("failed", &self.failure.is_some())
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("stack_size", &self.stack.size())
            .finish()
    }
}

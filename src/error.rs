use std::io;

/// A centralized error type for all scheduler and runtime operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The task record was created but its stack could not be mapped.
    /// Recoverable: no task is registered and the caller may retry with a
    /// smaller stack.
    #[error("failed to map a {size} byte task stack")]
    StackAlloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// The monotonic time source failed. There is no sane fallback value for
    /// the scheduling loop, so this aborts `run`.
    #[error("monotonic clock unavailable")]
    ClockUnavailable,

    /// A task body returned an error. Captured at the point of failure and
    /// surfaced out of `run` at the next dispatch boundary. The original
    /// error is preserved in the chain.
    #[error("task '{name}' failed")]
    TaskFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The main loop halted with live tasks remaining: some tasks were
    /// blocked forever with nobody left to wake them.
    #[error("{count} task(s) never completed")]
    TasksLeaked { count: usize },

    /// Only one runtime may be active on a given thread at a time.
    #[error("a runtime is already active on this thread")]
    RuntimeActive,
}

impl Error {
    /// Recoverable errors leave the runtime usable; everything else aborts
    /// the `run` call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StackAlloc { .. })
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::StackAlloc { size: a, .. }, Self::StackAlloc { size: b, .. }) => a == b,
            (Self::ClockUnavailable, Self::ClockUnavailable) => true,
            (Self::TaskFailed { name: a, .. }, Self::TaskFailed { name: b, .. }) => a == b,
            (Self::TasksLeaked { count: a }, Self::TasksLeaked { count: b }) => a == b,
            (Self::RuntimeActive, Self::RuntimeActive) => true,
            _ => false,
        }
    }
}

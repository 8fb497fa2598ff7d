use crate::context;
use crate::runtime::scheduler;
use crate::task::TaskId;
use std::cell::RefCell;
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    owner: Option<TaskId>,
    /// Blocked tasks in block order; woken from the tail.
    waiting: Vec<TaskId>,
}

/// Mutual exclusion between cooperatively scheduled tasks.
///
/// A task that finds the mutex owned joins the waiter list and suspends
/// indefinitely; [`unlock`](Mutex::unlock) hands ownership directly to the
/// most recently blocked waiter and wakes it. Direct handoff means a third
/// task can never slip in between an unlock and the waiter resuming, so a
/// woken waiter owns the mutex unconditionally.
///
/// The wake order is LIFO. Under sustained contention the oldest waiter can
/// starve; callers that need fairness must arrange it themselves.
///
/// Not reentrant, and there is no try-lock. Share between tasks via
/// `Rc<Mutex>`; the single-threaded runtime needs no `Send` or `Sync`.
/// Locking and unlocking outside of a running task panics.
#[derive(Debug, Default)]
pub struct Mutex {
    inner: RefCell<Inner>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                owner: None,
                waiting: Vec::new(),
            }),
        }
    }

    /// Acquire the mutex, suspending the current task until it is available.
    ///
    /// # Panics
    ///
    /// Outside of a running task, or when the current task already owns the
    /// mutex.
    #[track_caller]
    pub fn lock(&self) {
        let me = context::with_sched(|s| s.current_or_panic());

        {
            let mut inner = self.inner.borrow_mut();
            match inner.owner {
                None => {
                    inner.owner = Some(me);
                    return;
                }
                Some(owner) if owner == me => {
                    panic!("task {me} attempted to re-lock a mutex it already owns")
                }
                Some(_) => inner.waiting.push(me),
            }
        }

        trace!(task = %me, "blocked on mutex");
        context::with_sched_mut(|s| s.park_current_at(me, None));
        scheduler::transfer();

        // Resumed by an unlock that handed us ownership.
        debug_assert_eq!(self.inner.borrow().owner, Some(me));
    }

    /// Release the mutex, waking the most recently blocked waiter if any.
    ///
    /// # Panics
    ///
    /// Outside of a running task, or when the current task does not own the
    /// mutex.
    #[track_caller]
    pub fn unlock(&self) {
        let me = context::with_sched(|s| s.current_or_panic());

        let next = {
            let mut inner = self.inner.borrow_mut();
            assert_eq!(
                inner.owner,
                Some(me),
                "task {me} attempted to unlock a mutex it does not own"
            );
            inner.owner = inner.waiting.pop();
            inner.owner
        };

        if let Some(next) = next {
            trace!(task = %next, "mutex handed off");
            context::with_sched_mut(|s| s.make_ready(next));
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().owner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_new_mutex_is_unlocked() {
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_lock_outside_task_panics() {
        let mutex = Mutex::new();
        assert!(catch_unwind(AssertUnwindSafe(|| mutex.lock())).is_err());
    }

    #[test]
    fn test_unlock_outside_task_panics() {
        let mutex = Mutex::new();
        assert!(catch_unwind(AssertUnwindSafe(|| mutex.unlock())).is_err());
    }
}

use crate::task::{Task, TaskId};
use slab::Slab;

/// Intrusive doubly-linked task queue over the scheduler's arena.
///
/// Links are arena indices stored in the task records themselves, which
/// gives O(1) append and O(1) unlink from any position without the dangling
/// pointer hazards of raw-pointer intrusive lists. Two live instances exist
/// per scheduler: the ready queue (plain FIFO) and the sleeping queue
/// (sorted, see [`TaskQueue::insert_by_wake`]).
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

impl TaskQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub(crate) fn head(&self) -> Option<TaskId> {
        self.head
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append at the tail. The task must not currently be linked anywhere.
    pub(crate) fn push_back(&mut self, tasks: &mut Slab<Task>, id: TaskId) {
        debug_assert!(!tasks[id.as_usize()].is_linked());

        match self.tail {
            Some(tail) => {
                tasks[tail.as_usize()].next = Some(id);
                tasks[id.as_usize()].prev = Some(tail);
            }
            None => {
                self.head = Some(id);
                tasks[id.as_usize()].prev = None;
            }
        }
        self.tail = Some(id);
        tasks[id.as_usize()].next = None;
    }

    /// Unlink `id` from wherever it sits, head, middle or tail, using its
    /// own links. Calling this on a task whose links are already clear and
    /// which is not the single head element is a no-op.
    pub(crate) fn remove(&mut self, tasks: &mut Slab<Task>, id: TaskId) {
        let (prev, next) = {
            let task = &mut tasks[id.as_usize()];
            (task.prev.take(), task.next.take())
        };

        match prev {
            Some(prev) => tasks[prev.as_usize()].next = next,
            None if self.head == Some(id) => self.head = next,
            None => {}
        }

        match next {
            Some(next) => tasks[next.as_usize()].prev = prev,
            None if self.tail == Some(id) => self.tail = prev,
            None => {}
        }
    }

    /// Insert `id` at the position determined by `wake_at`, keeping timed
    /// members sorted ascending by wake time with indefinite members
    /// trailing.
    ///
    /// Scans from the head past members whose wake time is at most
    /// `wake_at`, so equal wake times keep arrival order. O(n) insertion
    /// buys the scheduler its O(1) "next timer to fire" lookup: the head is
    /// always the earliest timed sleeper, and a `None` head means no timer
    /// is pending at all.
    ///
    /// The position key is passed separately from `id` because arming a
    /// timeout always parks the *currently running* task, even when the
    /// timeout itself was computed for another task.
    pub(crate) fn insert_by_wake(
        &mut self,
        tasks: &mut Slab<Task>,
        id: TaskId,
        wake_at: Option<u64>,
    ) {
        debug_assert!(!tasks[id.as_usize()].is_linked());

        let mut at = match wake_at {
            Some(_) => self.head,
            // Indefinite sleepers go straight to the tail region.
            None => None,
        };

        if let Some(new_wake) = wake_at {
            while let Some(cur) = at {
                match tasks[cur.as_usize()].wake_at {
                    Some(wake) if wake <= new_wake => at = tasks[cur.as_usize()].next,
                    // Indefinite or strictly later: insert before it.
                    _ => break,
                }
            }
        }

        let Some(cur) = at else {
            return self.push_back(tasks, id);
        };

        let prev = tasks[cur.as_usize()].prev;
        tasks[id.as_usize()].next = Some(cur);
        tasks[id.as_usize()].prev = prev;
        tasks[cur.as_usize()].prev = Some(id);
        match prev {
            Some(prev) => tasks[prev.as_usize()].next = Some(id),
            None => self.head = Some(id),
        }
    }

    /// Full head-to-tail traversal; diagnostics and tests only.
    pub(crate) fn iter<'a>(&self, tasks: &'a Slab<Task>) -> impl Iterator<Item = TaskId> + 'a {
        let mut at = self.head;
        std::iter::from_fn(move || {
            let cur = at?;
            at = tasks[cur.as_usize()].next;
            Some(cur)
        })
    }
}

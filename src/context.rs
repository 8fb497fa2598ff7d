//! Thread-local runtime context.
//!
//! The scheduler is a plain value with an explicit install/teardown
//! lifecycle: `Builder::try_build` installs it here, `Runtime` teardown (or
//! drop) removes it. While installed, every scheduling operation reaches it
//! through these accessors. The `RefCell` is never borrowed across a stack
//! switch; each operation borrows, mutates, and releases before control can
//! leave the scheduler's structures.

use crate::error::Error;
use crate::runtime::scheduler::Scheduler;
use std::cell::RefCell;

thread_local! {
    static CONTEXT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Install a scheduler on this thread. At most one runtime may be active on
/// a given thread at a time.
pub(crate) fn install(sched: Scheduler) -> Result<(), Error> {
    CONTEXT.with(|ctx| {
        let mut slot = ctx.borrow_mut();
        if slot.is_some() {
            return Err(Error::RuntimeActive);
        }
        *slot = Some(sched);
        Ok(())
    })
}

/// Remove the scheduler from this thread, releasing every remaining task
/// record and stack. Idempotent.
pub(crate) fn teardown() {
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
}

pub(crate) fn is_installed() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().is_some())
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_sched<F, R>(f: F) -> R
where
    F: FnOnce(&Scheduler) -> R,
{
    CONTEXT.with(|ctx| {
        let slot = ctx.borrow();
        let sched = slot
            .as_ref()
            .expect("no cotask runtime is active on this thread");
        f(sched)
    })
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_sched_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    CONTEXT.with(|ctx| {
        let mut slot = ctx.borrow_mut();
        let sched = slot
            .as_mut()
            .expect("no cotask runtime is active on this thread");
        f(sched)
    })
}

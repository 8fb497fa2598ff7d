//! Single-threaded cooperative green threads.
//!
//! `cotask` multiplexes many tasks onto one OS thread with explicit stack
//! switching. There is no parallelism and no preemption: a task runs until
//! it yields, sleeps, blocks on a [`sync::Mutex`] or finishes, and the
//! scheduler then dispatches the next ready task in FIFO order. Scheduler
//! state is only ever touched between switches, so the whole runtime needs
//! no locks and no atomics.
//!
//! # Example
//!
//! ```
//! use cotask::Builder;
//!
//! let mut rt = Builder::new().try_build()?;
//!
//! rt.spawn("ticker", || {
//!     for _ in 0..3 {
//!         cotask::yield_now();
//!     }
//!     Ok(())
//! })?;
//!
//! rt.spawn("sleeper", || {
//!     let elapsed = cotask::sleep_for(10)?;
//!     assert!(elapsed >= 10);
//!     Ok(())
//! })?;
//!
//! rt.run()?;
//! # Ok::<(), cotask::Error>(())
//! ```
//!
//! Task bodies return `anyhow::Result<()>`; an `Err` stops the runtime and
//! surfaces out of [`Runtime::run`] as [`Error::TaskFailed`] with the
//! original error in the chain.

mod context;
mod error;
pub mod runtime;
mod stack;
pub mod sync;
mod task;
pub mod time;
mod utils;

pub use error::Error;
pub use runtime::{
    Builder, DEFAULT_STACK_SIZE, Runtime, WAIT_QUANTUM, current_task_name, dump_tasks,
    is_inside_task, require_inside_task, sleep_for, spawn, spawn_with_stack_size, yield_now,
};
pub use stack::MIN_STACK_SIZE;
pub use task::TaskId;
pub use time::{Clock, MonotonicClock};

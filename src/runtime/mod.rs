pub(crate) mod queue;
#[allow(clippy::module_inception)]
mod runtime;
pub(crate) mod scheduler;
pub mod wait;

pub use runtime::{Builder, DEFAULT_STACK_SIZE, Runtime, WAIT_QUANTUM};
pub use scheduler::{
    current_task_name, dump_tasks, is_inside_task, require_inside_task, sleep_for, spawn,
    spawn_with_stack_size, yield_now,
};

#[cfg(test)]
mod tests;

#![allow(unused)]

use crate::task::TaskId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Spawn,
    Dispatch,
    Yield,
    Sleep,
    MakeReady,
    Reap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Spawn { id: TaskId, name: String },
    Dispatch { id: TaskId },
    Yield { id: TaskId },
    Sleep { id: TaskId, wake_at: Option<u64> },
    MakeReady { id: TaskId, was_ready: bool },
    Reap { id: TaskId },
}

/// Test spy recording every scheduler call. Cheap introspection for tests,
/// compiled into the scheduler only under `cfg(test)`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker {
    calls: Rc<RefCell<HashMap<Method, Vec<Call>>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls.borrow_mut().entry(method).or_default().push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls.borrow().get(method).cloned().unwrap_or_default()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.borrow().get(method).map_or(0, |calls| calls.len())
    }
}

use super::scheduler::Scheduler;
use super::wait::WaitStrategy;
use super::{Builder, Runtime};
use crate::error::Error;
use crate::stack::MIN_STACK_SIZE;
use crate::sync::Mutex;
use crate::time::{Clock, MonotonicClock};
use crate::utils::tracker::{Call, Method};
use crate::{context, sleep_for, spawn, spawn_with_stack_size, yield_now};
use rstest::rstest;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

assert_impl_all!(Error: Send, Sync, std::error::Error);
assert_not_impl_any!(Runtime: Send, Sync);
assert_not_impl_any!(Mutex: Sync);

/// Clock that only moves when the wait strategy advances it, making timer
/// tests deterministic and instant.
#[derive(Debug, Clone)]
struct TestClock(Rc<Cell<u64>>);

impl Clock for TestClock {
    fn now_ms(&self) -> Result<u64, Error> {
        Ok(self.0.get())
    }
}

/// Companion wait strategy: instead of sleeping, jump the clock forward by
/// the requested timeout.
#[derive(Debug)]
struct AdvanceClock(Rc<Cell<u64>>);

impl WaitStrategy for AdvanceClock {
    fn wait(&mut self, timeout: Duration) {
        let step = (timeout.as_millis() as u64).max(1);
        self.0.set(self.0.get() + step);
    }
}

fn manual_runtime() -> (Runtime, Rc<Cell<u64>>) {
    let now = Rc::new(Cell::new(0));
    let rt = Builder::new()
        .clock(TestClock(now.clone()))
        .wait_strategy(AdvanceClock(now.clone()))
        .try_build()
        .unwrap();
    (rt, now)
}

fn log_of() -> Rc<RefCell<Vec<&'static str>>> {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn test_ready_queue_dispatch_is_fifo() {
    let mut rt = Builder::new().try_build().unwrap();
    let log = log_of();

    for tag in ["a", "b", "c"] {
        let log = log.clone();
        rt.spawn(tag, move || {
            log.borrow_mut().push(tag);
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn test_yield_interleaves_ready_tasks_round_robin() {
    let mut rt = Builder::new().try_build().unwrap();
    let log = log_of();

    for tag in ["a", "b"] {
        let log = log.clone();
        rt.spawn(tag, move || {
            log.borrow_mut().push(tag);
            yield_now();
            log.borrow_mut().push(tag);
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(*log.borrow(), vec!["a", "b", "a", "b"]);
}

#[test]
fn test_sleepers_wake_earliest_first() {
    let (mut rt, _) = manual_runtime();
    let log = log_of();

    for (tag, ms) in [("a", 30), ("b", 10), ("c", 20)] {
        let log = log.clone();
        rt.spawn(tag, move || {
            sleep_for(ms)?;
            log.borrow_mut().push(tag);
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(*log.borrow(), vec!["b", "c", "a"]);
}

#[test]
fn test_equal_timeouts_wake_in_arrival_order() {
    let (mut rt, _) = manual_runtime();
    let log = log_of();

    for tag in ["a", "b", "c"] {
        let log = log.clone();
        rt.spawn(tag, move || {
            sleep_for(10)?;
            log.borrow_mut().push(tag);
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(25)]
fn test_sleep_elapsed_is_at_least_requested(#[case] ms: u64) {
    let (mut rt, _) = manual_runtime();
    let elapsed = Rc::new(Cell::new(0));

    let got = elapsed.clone();
    rt.spawn("sleeper", move || {
        got.set(sleep_for(ms)?);
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    // The stepping wait advances at most a quantum past the deadline.
    assert!(elapsed.get() >= ms);
    assert!(elapsed.get() <= ms + super::WAIT_QUANTUM.as_millis() as u64);
}

#[test]
fn test_sleep_with_real_clock_takes_wall_time() {
    let mut rt = Builder::new().try_build().unwrap();
    let start = std::time::Instant::now();

    rt.spawn("sleeper", || {
        let elapsed = sleep_for(10)?;
        assert!(elapsed >= 10);
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
fn test_mutex_provides_mutual_exclusion() {
    let mut rt = Builder::new().try_build().unwrap();
    let mutex = Rc::new(Mutex::new());
    let in_critical = Rc::new(Cell::new(false));
    let sections = Rc::new(Cell::new(0));

    for tag in ["a", "b", "c"] {
        let mutex = mutex.clone();
        let in_critical = in_critical.clone();
        let sections = sections.clone();
        rt.spawn(tag, move || {
            for _ in 0..5 {
                mutex.lock();
                assert!(!in_critical.get(), "two tasks inside the critical section");
                in_critical.set(true);
                yield_now();
                in_critical.set(false);
                mutex.unlock();
                sections.set(sections.get() + 1);
            }
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(sections.get(), 15);
    assert!(!mutex.is_locked());
}

#[test]
fn test_mutex_wakes_waiters_lifo() {
    let mut rt = Builder::new().try_build().unwrap();
    let mutex = Rc::new(Mutex::new());
    let log = log_of();

    {
        let mutex = mutex.clone();
        rt.spawn("holder", move || {
            mutex.lock();
            // Let a, b and c block on the mutex, in that order.
            for _ in 0..3 {
                yield_now();
            }
            mutex.unlock();
            Ok(())
        })
        .unwrap();
    }

    for tag in ["a", "b", "c"] {
        let mutex = mutex.clone();
        let log = log.clone();
        rt.spawn(tag, move || {
            mutex.lock();
            log.borrow_mut().push(tag);
            mutex.unlock();
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
}

#[test]
fn test_blocked_forever_tasks_are_reported_leaked() {
    let mut rt = Builder::new().try_build().unwrap();
    let mutex = Rc::new(Mutex::new());

    {
        let mutex = mutex.clone();
        rt.spawn("holder", move || {
            mutex.lock();
            yield_now();
            // Returns without unlocking; the waiter below sleeps forever.
            Ok(())
        })
        .unwrap();
    }
    {
        let mutex = mutex.clone();
        rt.spawn("stuck", move || {
            mutex.lock();
            Ok(())
        })
        .unwrap();
    }

    assert!(matches!(rt.run(), Err(Error::TasksLeaked { count: 1 })));
}

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

#[test]
fn test_task_failure_surfaces_with_original_error() {
    let mut rt = Builder::new().try_build().unwrap();

    rt.spawn("doomed", || Err(Boom.into())).unwrap();

    match rt.run() {
        Err(Error::TaskFailed { name, source }) => {
            assert_eq!(name, "doomed");
            assert!(source.downcast_ref::<Boom>().is_some());
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
}

#[test]
fn test_failure_stops_the_loop_with_others_suspended() {
    let mut rt = Builder::new().try_build().unwrap();
    let resumed = Rc::new(Cell::new(false));

    {
        let resumed = resumed.clone();
        rt.spawn("bystander", move || {
            sleep_for(1)?;
            resumed.set(true);
            Ok(())
        })
        .unwrap();
    }
    rt.spawn("doomed", || Err(Boom.into())).unwrap();

    // The bystander arms its timer first, then the failure aborts the run
    // before the timer can fire.
    assert!(matches!(rt.run(), Err(Error::TaskFailed { .. })));
    assert!(!resumed.get());
}

#[test]
fn test_task_panic_resumes_on_run_caller() {
    let mut rt = Builder::new().try_build().unwrap();

    rt.spawn("kaboom", || panic!("kaboom")).unwrap();

    let payload = catch_unwind(AssertUnwindSafe(|| rt.run())).unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));
}

#[test]
fn test_spawn_from_task_grows_the_arena() {
    let mut rt = Builder::new().try_build().unwrap();
    let done = Rc::new(Cell::new(0));

    {
        let done = done.clone();
        rt.spawn("parent", move || {
            for i in 0..10 {
                let done = done.clone();
                spawn(format!("child-{i}"), move || {
                    done.set(done.get() + 1);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    assert_eq!(done.get(), 10);
}

#[test]
fn test_make_ready_is_idempotent() {
    let mut sched = Scheduler::new(MIN_STACK_SIZE, Box::new(MonotonicClock::new()));
    let ids = ["a", "b", "c"]
        .map(|tag| sched.spawn(tag.into(), MIN_STACK_SIZE, Box::new(|| Ok(()))).unwrap());

    // Waking an already-ready task must not duplicate or reorder it.
    sched.make_ready(ids[1]);
    sched.make_ready(ids[1]);

    assert_eq!(sched.ready_order(), ids.to_vec());
    let calls = sched.tracker.get_calls(&Method::MakeReady);
    assert_eq!(
        calls,
        vec![
            Call::MakeReady {
                id: ids[1],
                was_ready: true
            };
            2
        ]
    );
}

#[test]
fn test_tracker_observes_task_lifecycle() {
    let mut rt = Builder::new().try_build().unwrap();
    for tag in ["a", "b"] {
        rt.spawn(tag, || {
            yield_now();
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();

    let tracker = context::with_sched(|s| s.tracker.clone());
    assert_eq!(tracker.num_calls(&Method::Spawn), 2);
    assert_eq!(tracker.num_calls(&Method::Yield), 2);
    assert_eq!(tracker.num_calls(&Method::Dispatch), 4);
    assert_eq!(tracker.num_calls(&Method::Reap), 2);
}

#[test]
fn test_current_task_queries() {
    let mut rt = Builder::new().try_build().unwrap();

    assert!(!crate::is_inside_task());
    assert_eq!(crate::current_task_name(), None);

    rt.spawn("namey", || {
        assert!(crate::is_inside_task());
        crate::require_inside_task();
        assert_eq!(crate::current_task_name().as_deref(), Some("namey"));
        crate::dump_tasks();
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
    assert!(!crate::is_inside_task());
}

#[test]
#[should_panic(expected = "no cotask runtime is active on this thread")]
fn test_require_inside_task_panics_without_runtime() {
    crate::require_inside_task();
}

#[test]
#[should_panic(expected = "task-only operation called outside of a running task")]
fn test_require_inside_task_panics_between_tasks() {
    let _rt = Builder::new().try_build().unwrap();
    crate::require_inside_task();
}

#[derive(Debug)]
struct FailingClock {
    calls_left: Cell<u32>,
}

impl Clock for FailingClock {
    fn now_ms(&self) -> Result<u64, Error> {
        if self.calls_left.get() == 0 {
            return Err(Error::ClockUnavailable);
        }
        self.calls_left.set(self.calls_left.get() - 1);
        Ok(0)
    }
}

#[test]
fn test_clock_failure_aborts_run() {
    let mut rt = Builder::new()
        .clock(FailingClock {
            calls_left: Cell::new(1),
        })
        .try_build()
        .unwrap();

    rt.spawn("sleeper", || {
        sleep_for(100)?;
        Ok(())
    })
    .unwrap();

    assert!(matches!(rt.run(), Err(Error::ClockUnavailable)));
}

#[rstest]
#[case(1000)]
#[case(MIN_STACK_SIZE / 2)]
#[should_panic(expected = "stack size must be a power of two")]
fn test_builder_rejects_bad_stack_sizes(#[case] size: usize) {
    let _ = Builder::new().default_stack_size(size);
}

#[test]
#[should_panic(expected = "wait quantum must be non-zero")]
fn test_builder_rejects_zero_quantum() {
    let _ = Builder::new().wait_quantum(Duration::ZERO);
}

#[test]
fn test_spawn_with_huge_stack_size_returns_alloc_error() {
    let mut rt = Builder::new().try_build().unwrap();

    let err = spawn_with_stack_size("huge", usize::MAX, || Ok(())).unwrap_err();
    assert!(matches!(err, Error::StackAlloc { size, .. } if size == usize::MAX));
    assert!(err.is_recoverable());

    // No task was registered, so the run has nothing to do.
    rt.run().unwrap();
}

#[test]
fn test_relocking_an_owned_mutex_panics_the_task() {
    let mut rt = Builder::new().try_build().unwrap();
    let mutex = Rc::new(Mutex::new());

    {
        let mutex = mutex.clone();
        rt.spawn("greedy", move || {
            mutex.lock();
            mutex.lock();
            Ok(())
        })
        .unwrap();
    }

    let payload = catch_unwind(AssertUnwindSafe(|| rt.run())).unwrap_err();
    let msg = payload.downcast_ref::<String>().unwrap();
    assert!(msg.contains("re-lock a mutex it already owns"), "{msg}");
}

#[test]
fn test_unlocking_an_unowned_mutex_panics_the_task() {
    let mut rt = Builder::new().try_build().unwrap();
    let mutex = Rc::new(Mutex::new());

    {
        let mutex = mutex.clone();
        rt.spawn("impostor", move || {
            mutex.unlock();
            Ok(())
        })
        .unwrap();
    }

    let payload = catch_unwind(AssertUnwindSafe(|| rt.run())).unwrap_err();
    let msg = payload.downcast_ref::<String>().unwrap();
    assert!(msg.contains("unlock a mutex it does not own"), "{msg}");
}

/// Like [`AdvanceClock`], but records every requested timeout and can
/// pretend the first sleep elapsed without the clock moving.
#[derive(Debug)]
struct RecordingWait {
    now: Rc<Cell<u64>>,
    waits: Rc<RefCell<Vec<Duration>>>,
    stall_first: bool,
}

impl WaitStrategy for RecordingWait {
    fn wait(&mut self, timeout: Duration) {
        self.waits.borrow_mut().push(timeout);
        if self.stall_first {
            self.stall_first = false;
            return;
        }
        self.now.set(self.now.get() + (timeout.as_millis() as u64).max(1));
    }
}

fn recording_runtime(stall_first: bool) -> (Runtime, Rc<RefCell<Vec<Duration>>>) {
    let now = Rc::new(Cell::new(0));
    let waits = Rc::new(RefCell::new(Vec::new()));
    let rt = Builder::new()
        .clock(TestClock(now.clone()))
        .wait_strategy(RecordingWait {
            now,
            waits: waits.clone(),
            stall_first,
        })
        .try_build()
        .unwrap();
    (rt, waits)
}

#[test]
fn test_wait_sleeps_to_the_deadline_in_one_block() {
    let (mut rt, waits) = recording_runtime(false);

    rt.spawn("sleeper", || {
        sleep_for(20)?;
        Ok(())
    })
    .unwrap();
    rt.run().unwrap();

    // The deadline is known, so the idle wait asks for all of it at once.
    assert_eq!(*waits.borrow(), vec![Duration::from_millis(20)]);
}

#[test]
fn test_lagging_clock_rechecks_in_quantum_slices() {
    let (mut rt, waits) = recording_runtime(true);

    rt.spawn("sleeper", || {
        sleep_for(20)?;
        Ok(())
    })
    .unwrap();
    rt.run().unwrap();

    // The first sleep elapsed with the clock unmoved; the retries are
    // quantum-sized until it catches up.
    let waits = waits.borrow();
    assert_eq!(waits[0], Duration::from_millis(20));
    assert!(waits.len() > 1);
    assert!(waits[1..].iter().all(|&w| w == super::WAIT_QUANTUM));
}

#[test]
fn test_custom_stack_size_is_honored() {
    let mut rt = Builder::new()
        .default_stack_size(128 * 1024)
        .try_build()
        .unwrap();

    rt.spawn("deep", || {
        // A frame this large would fault a minimal stack.
        let buf = [0u8; 48 * 1024];
        assert_eq!(buf.iter().map(|&b| b as u64).sum::<u64>(), 0);
        Ok(())
    })
    .unwrap();

    rt.run().unwrap();
}

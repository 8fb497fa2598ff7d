use crate::error::Error;
use std::fmt;
use std::time::Instant;

/// Monotonic millisecond time source consumed by the scheduler.
///
/// The epoch is arbitrary; only differences matter. Implementations must be
/// monotonically non-decreasing and unaffected by wall-clock adjustments.
/// A failing implementation surfaces [`Error::ClockUnavailable`], which is
/// fatal to the scheduling loop.
pub trait Clock: fmt::Debug + 'static {
    fn now_ms(&self) -> Result<u64, Error>;
}

/// Default clock: `std::time::Instant` anchored at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Result<u64, Error> {
        Ok(self.epoch.elapsed().as_millis() as u64)
    }
}

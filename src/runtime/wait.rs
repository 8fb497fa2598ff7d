use std::fmt;
use std::thread;
use std::time::Duration;

/// Idle-wait seam for the main loop.
///
/// When nothing is ready the scheduler asks the strategy to block the host
/// thread until the next timer deadline (re-requesting a short quantum while
/// the clock has not caught up), then promotes expired sleepers. Only
/// time-based wakeups are
/// resolved here; a future strategy can substitute real I/O-readiness
/// multiplexing without touching the scheduler core.
pub trait WaitStrategy: fmt::Debug + 'static {
    /// Block for roughly `timeout`. Returning early is harmless: the
    /// scheduler re-checks and takes another promotion pass.
    fn wait(&mut self, timeout: Duration);
}

/// Default strategy: plain OS sleep.
#[derive(Debug, Default)]
pub struct SleepWait;

impl WaitStrategy for SleepWait {
    fn wait(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            thread::sleep(timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sleep_wait_blocks_at_least_timeout() {
        let start = Instant::now();
        SleepWait.wait(Duration::from_millis(3));
        assert!(start.elapsed() >= Duration::from_millis(3));
    }

    #[test]
    fn test_sleep_wait_zero_returns_immediately() {
        let start = Instant::now();
        SleepWait.wait(Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}

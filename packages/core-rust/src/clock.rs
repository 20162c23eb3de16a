//! Injectable time source for the limiter primitives.
//!
//! The token bucket measures refill windows against a [`ClockSource`] instead
//! of calling `Instant::now()` directly, so tests can step through window
//! resets deterministically with a [`ManualClock`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Abstraction over monotonic time for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a manual
/// one. The default implementation ([`SystemClock`]) delegates to
/// [`Instant::now`].
pub trait ClockSource: Send + Sync {
    /// Returns the current monotonic instant.
    fn now(&self) -> Instant;
}

/// Default clock source that reads the real monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock source that follows the tokio timer.
///
/// Outside a runtime this is the same monotonic clock as [`SystemClock`].
/// Inside a runtime with a paused timer it moves with `tokio::time::advance`,
/// which keeps bucket refills in step with the sleeps a throttled stream
/// schedules between windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl ClockSource for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Manually driven clock for tests.
///
/// Starts at the instant it is created and only moves when [`advance`] is
/// called. Clones share the same underlying time, so a test can hand one
/// clone to a bucket and keep the other to drive it.
///
/// [`advance`]: ManualClock::advance
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Moves the clock forward by `step`.
    pub fn advance(&self, step: Duration) {
        *self.now.lock() += step;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: Instant) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

//! Fixed-window token bucket.
//!
//! The bucket refills to full capacity at fixed window boundaries instead of
//! trickling tokens in continuously, so a burst at the start of a window can
//! use the whole budget at once. Capacity is re-read from a provider closure
//! on every operation, which lets the configured limit change at runtime
//! without rebuilding the bucket.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::{ClockSource, SystemClock};

/// Outcome of a [`FixedTokenBucket::try_consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The requested tokens were debited in full.
    Admitted,
    /// The current window cannot cover the request. Nothing was debited.
    Throttled {
        /// Time remaining until the next window reset. Zero means the reset
        /// is already due and the next call will observe a fresh window.
        retry_after: Duration,
    },
}

struct BucketState {
    available: u64,
    window_start: Instant,
}

/// Shared fixed-window token bucket.
///
/// A consume request is debited in full or not at all; there is no partial
/// debit. The refill check, the capacity re-read, and the debit happen under
/// one lock, so concurrent callers observe a linearizable sequence of debits
/// and window resets and the bucket never over-admits within a window.
///
/// A capacity provider returning 0 makes the bucket admit nothing. Callers
/// that treat 0 as "unlimited" must skip the bucket instead of consulting it;
/// [`ThrottledStream`](crate::stream::ThrottledStream) does exactly that.
pub struct FixedTokenBucket {
    capacity: Box<dyn Fn() -> u64 + Send + Sync>,
    refill_period: Duration,
    state: Mutex<BucketState>,
    clock: Arc<dyn ClockSource>,
}

impl FixedTokenBucket {
    /// Creates a bucket with a fixed capacity per window.
    #[must_use]
    pub fn new(capacity: u64, refill_period: Duration) -> Self {
        Self::from_provider(move || capacity, refill_period)
    }

    /// Creates a bucket whose capacity is re-read from `capacity` on every
    /// operation.
    #[must_use]
    pub fn from_provider(
        capacity: impl Fn() -> u64 + Send + Sync + 'static,
        refill_period: Duration,
    ) -> Self {
        Self::with_clock(capacity, refill_period, Arc::new(SystemClock))
    }

    /// Creates a bucket driven by an explicit clock.
    ///
    /// Tests pair this with [`ManualClock`](crate::clock::ManualClock) to
    /// step through refill windows without sleeping.
    #[must_use]
    pub fn with_clock(
        capacity: impl Fn() -> u64 + Send + Sync + 'static,
        refill_period: Duration,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let available = capacity();
        Self {
            capacity: Box::new(capacity),
            refill_period,
            state: Mutex::new(BucketState {
                available,
                window_start: clock.now(),
            }),
            clock,
        }
    }

    /// Attempts to debit `tokens` from the current window.
    ///
    /// A throttled call leaves the bucket untouched and reports how long the
    /// caller has to wait for the next window reset. Requests larger than the
    /// full capacity stay throttled until the provider raises the capacity.
    pub fn try_consume(&self, tokens: u64) -> ConsumeOutcome {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let capacity = (self.capacity)();

        if now.duration_since(state.window_start) >= self.refill_period {
            state.available = capacity;
            state.window_start = now;
        } else {
            // A capacity decrease applies immediately: available never
            // exceeds what the provider returns right now.
            state.available = state.available.min(capacity);
        }

        if tokens <= state.available {
            state.available -= tokens;
            ConsumeOutcome::Admitted
        } else {
            let next_reset = state.window_start + self.refill_period;
            ConsumeOutcome::Throttled {
                retry_after: next_reset.saturating_duration_since(now),
            }
        }
    }

    /// Tokens left in the current window. Diagnostic read; does not refill.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.state.lock().available
    }

    /// Current value of the capacity provider.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        (self.capacity)()
    }

    /// The fixed window length tokens replenish on.
    #[must_use]
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }
}

impl fmt::Debug for FixedTokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedTokenBucket")
            .field("capacity", &(self.capacity)())
            .field("refill_period", &self.refill_period)
            .field("available", &self.available())
            .finish()
    }
}

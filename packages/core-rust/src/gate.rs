//! Concurrency admission gate.
//!
//! Bounds how many requests are in flight at once. Admission either succeeds
//! immediately or is denied; nothing ever queues behind the gate. An admitted
//! caller holds an [`AdmissionPermit`], and dropping the permit is the exit,
//! so success, failure, and cancellation all release the slot exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared in-flight counter with a per-call bound.
///
/// The bound is an argument to [`try_enter`](AdmissionGate::try_enter) rather
/// than gate state, so callers can re-read a dynamic limit on every request.
/// A bound of 0 means unlimited: entry is granted without touching the
/// counter at all.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    in_flight: Arc<AtomicU64>,
}

impl AdmissionGate {
    /// Creates a gate with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to occupy one slot under `max_concurrent`.
    ///
    /// Returns `None` when the counter already sits at the bound. The
    /// compare-and-swap loop never admits past the bound, however many
    /// callers race.
    #[must_use]
    pub fn try_enter(&self, max_concurrent: u64) -> Option<AdmissionPermit> {
        if max_concurrent == 0 {
            return Some(AdmissionPermit { slot: None });
        }

        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= max_concurrent {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(AdmissionPermit {
                        slot: Some(Arc::clone(&self.in_flight)),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Number of currently admitted callers.
    ///
    /// Entries granted under an unlimited bound are not counted.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// RAII handle for one admitted caller. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    /// `None` for permits granted under an unlimited bound; there is no
    /// slot to give back.
    slot: Option<Arc<AtomicU64>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(slot) = &self.slot {
            slot.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

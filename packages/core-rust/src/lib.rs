//! `FlowGuard` Core -- resource-limiting primitives for byte streams.
//!
//! Building blocks shared by the HTTP guard layers: a fixed-window token
//! bucket, a concurrency admission gate, and `AsyncRead`/`AsyncWrite`
//! decorators that cap, pace, or expire transfers. Nothing in this crate
//! knows about HTTP; the `flowguard-tower` crate maps these primitives onto
//! request pipelines.

pub mod bucket;
pub mod clock;
pub mod gate;
pub mod stream;

pub use bucket::{ConsumeOutcome, FixedTokenBucket};
pub use clock::{ClockSource, ManualClock, SystemClock, TokioClock};
pub use gate::{AdmissionGate, AdmissionPermit};
pub use stream::{CeilingExceeded, IdleTimeoutStream, LimitedStream, ThrottledStream};

//! Stream decorators enforcing transfer limits.
//!
//! Each decorator wraps an `AsyncRead`/`AsyncWrite` byte stream and is owned
//! by a single task, like any other tokio I/O wrapper:
//!
//! - [`IdleTimeoutStream`] closes the stream after a gap with no activity.
//! - [`LimitedStream`] fails the transfer at a cumulative byte ceiling.
//! - [`ThrottledStream`] paces the transfer through a shared token bucket.
//!
//! Inner streams must be `Unpin`. Decorators compose: a request body can be
//! wrapped by all three at once, each enforcing its own limit independently.

pub mod idle_timeout;
pub mod limited;
pub mod throttled;

pub use idle_timeout::IdleTimeoutStream;
pub use limited::{CeilingExceeded, LimitedStream};
pub use throttled::ThrottledStream;

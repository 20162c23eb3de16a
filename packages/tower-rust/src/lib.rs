//! `FlowGuard` Tower -- HTTP resource-limiting middleware for `axum`/`tower` stacks.
//!
//! Each guard is a standalone [`tower::Layer`]; [`pipeline::apply_guards`]
//! assembles the usual stack from a [`pipeline::GuardConfig`].

pub mod bandwidth;
mod body;
pub mod concurrency;
pub mod content_length;
pub mod delay;
pub mod meta;
pub mod pipeline;
pub mod timeout;
pub mod uri;

pub use bandwidth::{MaxBandwidthGlobalLayer, MaxBandwidthLayer};
pub use concurrency::MaxConcurrentRequestsLayer;
pub use content_length::MaxRequestContentLengthLayer;
pub use delay::MinResponseDelayLayer;
pub use meta::{Provider, RequestMeta};
pub use pipeline::{apply_guards, GuardConfig};
pub use timeout::ConnectionTimeoutLayer;
pub use uri::{MaxQueryStringLengthLayer, MaxUrlLengthLayer};

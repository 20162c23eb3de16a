//! Guard stack assembly.
//!
//! Applications can compose the individual layers by hand; this module
//! wires the usual stack in one call so every deployment gets the same
//! ordering.

use std::time::Duration;

use axum::Router;

use crate::bandwidth::MaxBandwidthGlobalLayer;
use crate::concurrency::MaxConcurrentRequestsLayer;
use crate::content_length::MaxRequestContentLengthLayer;
use crate::delay::MinResponseDelayLayer;
use crate::timeout::ConnectionTimeoutLayer;
use crate::uri::{MaxQueryStringLengthLayer, MaxUrlLengthLayer};

/// Static limits for the standard guard stack.
///
/// `None` leaves the corresponding guard out entirely.
#[derive(Debug, Clone, Default)]
pub struct GuardConfig {
    /// Concurrent requests admitted before shedding with `503`.
    pub max_concurrent_requests: Option<u64>,
    /// Decoded request-URI length admitted before `414`.
    pub max_url_length: Option<usize>,
    /// Decoded query-string length admitted before `414`.
    pub max_query_string_length: Option<usize>,
    /// Artificial delay before handling starts.
    pub min_response_delay: Option<Duration>,
    /// Idle gap after which a body transfer is aborted.
    pub connection_timeout: Option<Duration>,
    /// Request body bytes admitted before `413`/`411`.
    pub max_request_content_length: Option<u64>,
    /// Process-wide bytes-per-second budget shared by all exchanges.
    pub max_bandwidth: Option<u64>,
}

/// Wraps `router` with the guards enabled in `config`.
///
/// Layer order (outermost to innermost):
/// 1. `MaxConcurrentRequestsLayer` -- shed excess load before any other work.
/// 2. `MaxUrlLengthLayer` -- request-line check, no body involved.
/// 3. `MaxQueryStringLengthLayer` -- request-line check, no body involved.
/// 4. `MinResponseDelayLayer` -- hold admitted requests for the configured time.
/// 5. `ConnectionTimeoutLayer` -- idle deadlines around both bodies.
/// 6. `MaxRequestContentLengthLayer` -- declared and actual body size.
/// 7. `MaxBandwidthGlobalLayer` -- pacing applies only to exchanges every
///    other guard admitted.
#[must_use]
pub fn apply_guards(router: Router, config: &GuardConfig) -> Router {
    let mut router = router;

    // Router::layer wraps everything added so far, so the innermost guard
    // goes on first.
    if let Some(rate) = config.max_bandwidth {
        router = router.layer(MaxBandwidthGlobalLayer::new(rate));
    }
    if let Some(max_bytes) = config.max_request_content_length {
        router = router.layer(MaxRequestContentLengthLayer::new(max_bytes));
    }
    if let Some(timeout) = config.connection_timeout {
        router = router.layer(ConnectionTimeoutLayer::new(timeout));
    }
    if let Some(delay) = config.min_response_delay {
        router = router.layer(MinResponseDelayLayer::new(delay));
    }
    if let Some(max_chars) = config.max_query_string_length {
        router = router.layer(MaxQueryStringLengthLayer::new(max_chars));
    }
    if let Some(max_chars) = config.max_url_length {
        router = router.layer(MaxUrlLengthLayer::new(max_chars));
    }
    if let Some(limit) = config.max_concurrent_requests {
        router = router.layer(MaxConcurrentRequestsLayer::new(limit));
    }

    router
}

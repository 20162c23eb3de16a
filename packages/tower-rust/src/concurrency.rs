//! Concurrency admission middleware.
//!
//! Bounds the number of requests processing concurrently. When the limit
//! is reached, new requests are rejected immediately with `503 Service
//! Unavailable` rather than queueing. A limit of zero admits everything
//! without counting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use flowguard_core::AdmissionGate;
use http::{Request, StatusCode};
use tower::{Layer, Service};

use crate::body::reject;
use crate::meta::{Provider, RequestMeta};

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// Applies [`MaxConcurrentRequestsService`] to an inner service.
///
/// The in-flight count lives in the layer, so every service built from one
/// layer shares the same gate. The limit is re-read per request.
#[derive(Debug, Clone)]
pub struct MaxConcurrentRequestsLayer {
    gate: Arc<AdmissionGate>,
    limit: Provider<u64>,
}

impl MaxConcurrentRequestsLayer {
    /// Create a layer admitting at most `limit` concurrent requests.
    #[must_use]
    pub fn new(limit: impl Into<Provider<u64>>) -> Self {
        Self {
            gate: Arc::new(AdmissionGate::new()),
            limit: limit.into(),
        }
    }

    /// Create a layer whose limit is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(limit: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> u64 + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(limit))
    }
}

impl<S> Layer<S> for MaxConcurrentRequestsLayer {
    type Service = MaxConcurrentRequestsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaxConcurrentRequestsService {
            inner,
            gate: Arc::clone(&self.gate),
            limit: self.limit.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Rejects requests beyond the concurrency limit with `503`.
#[derive(Debug, Clone)]
pub struct MaxConcurrentRequestsService<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
    limit: Provider<u64>,
}

impl<S> Service<Request<Body>> for MaxConcurrentRequestsService<S>
where
    S: Service<Request<Body>, Response = Response>,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let limit = self.limit.get(RequestMeta::from_request(&request));

        let Some(permit) = self.gate.try_enter(limit) else {
            tracing::info!(
                limit,
                in_flight = self.gate.in_flight(),
                "concurrent request limit reached, rejecting"
            );
            return Box::pin(async move {
                Ok(reject(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"))
            });
        };

        // The permit is dropped inside the future, after the inner service
        // finished, so the slot stays held for the whole request.
        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

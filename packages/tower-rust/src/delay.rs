//! Minimum response delay middleware.
//!
//! Holds every request for a configured duration before it reaches the
//! inner service. Useful for smoke-testing client timeout handling and for
//! slowing abusive endpoints down without rejecting them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use http::Request;
use tower::{Layer, Service};

use crate::meta::{Provider, RequestMeta};

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// Applies [`MinResponseDelayService`] to an inner service.
#[derive(Debug, Clone)]
pub struct MinResponseDelayLayer {
    delay: Provider<Duration>,
}

impl MinResponseDelayLayer {
    /// Create a layer delaying every request by `delay`.
    #[must_use]
    pub fn new(delay: impl Into<Provider<Duration>>) -> Self {
        Self {
            delay: delay.into(),
        }
    }

    /// Create a layer whose delay is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(delay: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> Duration + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(delay))
    }
}

impl<S> Layer<S> for MinResponseDelayLayer {
    type Service = MinResponseDelayService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MinResponseDelayService {
            inner,
            delay: self.delay.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Sleeps before handling. A zero delay forwards immediately.
#[derive(Debug, Clone)]
pub struct MinResponseDelayService<S> {
    inner: S,
    delay: Provider<Duration>,
}

impl<S> Service<Request<Body>> for MinResponseDelayService<S>
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
        let delay = self.delay.get(RequestMeta::from_request(&request));

        // The inner future is created up front but first polled after the
        // sleep, so handling starts once the delay has passed.
        let fut = self.inner.call(request);
        Box::pin(async move {
            if !delay.is_zero() {
                tracing::debug!(?delay, "delaying request handling");
                tokio::time::sleep(delay).await;
            }
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;

    use http::StatusCode;
    use tokio::time::Instant;
    use tower::ServiceExt;

    #[derive(Debug, Clone)]
    struct OkService;

    impl Service<Request<Body>> for OkService {
        type Response = Response;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request<Body>) -> Self::Future {
            Box::pin(async move { Ok(Response::new(Body::empty())) })
        }
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn responses_wait_out_the_configured_delay() {
        let service =
            MinResponseDelayLayer::new(Duration::from_millis(250)).layer(OkService);
        let started = Instant::now();

        let response = service.oneshot(request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_forwards_immediately() {
        let service = MinResponseDelayLayer::new(Duration::ZERO).layer(OkService);
        let started = Instant::now();

        let response = service.oneshot(request("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_are_read_per_request() {
        let layer = MinResponseDelayLayer::per_request(|meta| {
            if meta.uri().path() == "/throttled" {
                Duration::from_secs(1)
            } else {
                Duration::ZERO
            }
        });
        let service = layer.layer(OkService);

        let started = Instant::now();
        service.clone().oneshot(request("/fast")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = Instant::now();
        service.oneshot(request("/throttled")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }
}

//! Connection idle-timeout middleware.
//!
//! Wraps the request body and the response body in idle-timeout decorators
//! so a transfer that goes quiet is aborted instead of holding the
//! connection open. Both sides use the same per-request duration but keep
//! independent deadlines; the response deadline starts counting when the
//! response body exists, not when the request arrived.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use flowguard_core::IdleTimeoutStream;
use http::Request;
use tower::{Layer, Service};

use crate::body::splice;
use crate::meta::{Provider, RequestMeta};

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// Applies [`ConnectionTimeoutService`] to an inner service.
#[derive(Debug, Clone)]
pub struct ConnectionTimeoutLayer {
    timeout: Provider<Duration>,
}

impl ConnectionTimeoutLayer {
    /// Create a layer aborting transfers idle for longer than `timeout`.
    #[must_use]
    pub fn new(timeout: impl Into<Provider<Duration>>) -> Self {
        Self {
            timeout: timeout.into(),
        }
    }

    /// Create a layer whose timeout is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(timeout: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> Duration + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(timeout))
    }
}

impl<S> Layer<S> for ConnectionTimeoutLayer {
    type Service = ConnectionTimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectionTimeoutService {
            inner,
            timeout: self.timeout.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Aborts request and response bodies that stay idle past the timeout.
///
/// The abort surfaces as an [`std::io::ErrorKind::TimedOut`] stream error
/// wherever the body is being consumed, which ends the exchange; there is
/// no status code for a connection that went away.
#[derive(Debug, Clone)]
pub struct ConnectionTimeoutService<S> {
    inner: S,
    timeout: Provider<Duration>,
}

impl<S> Service<Request<Body>> for ConnectionTimeoutService<S>
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
        let timeout = self.timeout.get(RequestMeta::from_request(&request));

        let (parts, body) = request.into_parts();
        let body = splice(body, move |reader| IdleTimeoutStream::new(reader, timeout));
        let fut = self.inner.call(Request::from_parts(parts, body));

        Box::pin(async move {
            let response = fut.await?;
            let (parts, body) = response.into_parts();
            let body = splice(body, move |reader| IdleTimeoutStream::new(reader, timeout));
            Ok(Response::from_parts(parts, body))
        })
    }
}

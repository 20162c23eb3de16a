//! Request-line length limiting middleware.
//!
//! Two guards over the request line: one for the whole URI and one for
//! just the query string. Both measure the percent-decoded text, so
//! padding a URI with escapes does not evade the limit, and both answer
//! `414 URI Too Long` without invoking downstream.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use http::{Request, StatusCode};
use percent_encoding::percent_decode_str;
use tower::{Layer, Service};

use crate::body::reject;
use crate::meta::{Provider, RequestMeta};

const URI_TOO_LONG: &str = "URI Too Long";

/// Length of `value` once percent escapes are resolved.
fn decoded_length(value: &str) -> usize {
    percent_decode_str(value).decode_utf8_lossy().chars().count()
}

// ---------------------------------------------------------------------------
// Max URL length
// ---------------------------------------------------------------------------

/// Applies [`MaxUrlLengthService`] to an inner service.
#[derive(Debug, Clone)]
pub struct MaxUrlLengthLayer {
    limit: Provider<usize>,
}

impl MaxUrlLengthLayer {
    /// Create a layer capping the decoded request URI at `limit` characters.
    #[must_use]
    pub fn new(limit: impl Into<Provider<usize>>) -> Self {
        Self {
            limit: limit.into(),
        }
    }

    /// Create a layer whose cap is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(limit: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> usize + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(limit))
    }
}

impl<S> Layer<S> for MaxUrlLengthLayer {
    type Service = MaxUrlLengthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaxUrlLengthService {
            inner,
            limit: self.limit.clone(),
        }
    }
}

/// Rejects requests whose URI, as received on the request line, decodes to
/// more characters than the limit.
#[derive(Debug, Clone)]
pub struct MaxUrlLengthService<S> {
    inner: S,
    limit: Provider<usize>,
}

impl<S> Service<Request<Body>> for MaxUrlLengthService<S>
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
        let length = decoded_length(&request.uri().to_string());

        if length > limit {
            tracing::info!(length, limit, "request URI too long, rejecting");
            return Box::pin(async move {
                Ok(reject(StatusCode::URI_TOO_LONG, URI_TOO_LONG))
            });
        }

        Box::pin(self.inner.call(request))
    }
}

// ---------------------------------------------------------------------------
// Max query string length
// ---------------------------------------------------------------------------

/// Applies [`MaxQueryStringLengthService`] to an inner service.
#[derive(Debug, Clone)]
pub struct MaxQueryStringLengthLayer {
    limit: Provider<usize>,
}

impl MaxQueryStringLengthLayer {
    /// Create a layer capping the decoded query string at `limit` characters.
    #[must_use]
    pub fn new(limit: impl Into<Provider<usize>>) -> Self {
        Self {
            limit: limit.into(),
        }
    }

    /// Create a layer whose cap is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(limit: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> usize + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(limit))
    }
}

impl<S> Layer<S> for MaxQueryStringLengthLayer {
    type Service = MaxQueryStringLengthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaxQueryStringLengthService {
            inner,
            limit: self.limit.clone(),
        }
    }
}

/// Rejects requests whose query string decodes to more characters than the
/// limit. Requests without a query string always pass.
#[derive(Debug, Clone)]
pub struct MaxQueryStringLengthService<S> {
    inner: S,
    limit: Provider<usize>,
}

impl<S> Service<Request<Body>> for MaxQueryStringLengthService<S>
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
        if let Some(query) = request.uri().query() {
            let limit = self.limit.get(RequestMeta::from_request(&request));
            let length = decoded_length(query);

            if length > limit {
                tracing::info!(length, limit, "query string too long, rejecting");
                return Box::pin(async move {
                    Ok(reject(StatusCode::URI_TOO_LONG, URI_TOO_LONG))
                });
            }
        }

        Box::pin(self.inner.call(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Debug, Clone)]
    struct CountingService {
        calls: Arc<AtomicUsize>,
    }

    impl CountingService {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Service<Request<Body>> for CountingService {
        type Response = Response;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request<Body>) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(Response::new(Body::empty())) })
        }
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn short_uris_pass() {
        let inner = CountingService::new();
        let calls = Arc::clone(&inner.calls);
        let service = MaxUrlLengthLayer::new(16usize).layer(inner);

        let response = service.oneshot(request("/short")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn long_uris_are_rejected_without_reaching_downstream() {
        let inner = CountingService::new();
        let calls = Arc::clone(&inner.calls);
        let service = MaxUrlLengthLayer::new(16usize).layer(inner);

        let response = service
            .oneshot(request("/a/very/long/path/indeed"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::URI_TOO_LONG);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let text = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&text[..], b"URI Too Long");
    }

    #[tokio::test]
    async fn uris_are_measured_after_percent_decoding() {
        // Thirteen raw characters decode to five, under the limit of eight.
        let service = MaxUrlLengthLayer::new(8usize).layer(CountingService::new());
        let response = service.oneshot(request("/%61%62%63%64")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn query_strings_over_the_limit_are_rejected() {
        let service = MaxQueryStringLengthLayer::new(5usize).layer(CountingService::new());

        let response = service.oneshot(request("/p?q=123456")).await.unwrap();
        assert_eq!(response.status(), StatusCode::URI_TOO_LONG);
    }

    #[tokio::test]
    async fn query_strings_are_measured_after_percent_decoding() {
        let service = MaxQueryStringLengthLayer::new(5usize).layer(CountingService::new());

        // Nine raw characters decode to three.
        let response = service.oneshot(request("/p?%41%42%43")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn requests_without_a_query_string_always_pass() {
        let service = MaxQueryStringLengthLayer::new(0usize).layer(CountingService::new());

        let response = service.oneshot(request("/plain")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

//! Bandwidth throttling middleware.
//!
//! Paces request and response bodies through a shared token bucket so an
//! exchange never moves faster than the configured bytes-per-second rate.
//! Throttling only ever delays a transfer; nothing is rejected here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use flowguard_core::{FixedTokenBucket, ThrottledStream, TokioClock};
use http::Request;
use tower::{Layer, Service};

use crate::body::splice;
use crate::meta::{Provider, RequestMeta};

/// Bytes-per-second pacing window.
const PACING_WINDOW: Duration = Duration::from_secs(1);

/// Buckets here run on [`TokioClock`] so window resets and the pacing sleeps
/// a [`ThrottledStream`] schedules between windows share one timeline.
fn pacing_bucket(rate: impl Fn() -> u64 + Send + Sync + 'static) -> Arc<FixedTokenBucket> {
    Arc::new(FixedTokenBucket::with_clock(
        rate,
        PACING_WINDOW,
        Arc::new(TokioClock),
    ))
}

fn wrap_request(request: Request<Body>, bucket: &Arc<FixedTokenBucket>) -> Request<Body> {
    let bucket = Arc::clone(bucket);
    let (parts, body) = request.into_parts();
    let body = splice(body, move |reader| ThrottledStream::new(reader, bucket));
    Request::from_parts(parts, body)
}

fn wrap_response(response: Response, bucket: Arc<FixedTokenBucket>) -> Response {
    let (parts, body) = response.into_parts();
    let body = splice(body, move |reader| ThrottledStream::new(reader, bucket));
    Response::from_parts(parts, body)
}

// ---------------------------------------------------------------------------
// Global layer
// ---------------------------------------------------------------------------

/// Applies one process-wide bandwidth budget to every exchange.
///
/// All requests passing through services built from the same layer share a
/// single bucket. The rate is re-read from the getter on every refill, so
/// it can be changed at runtime; a rate of zero leaves bodies untouched.
#[derive(Debug, Clone)]
pub struct MaxBandwidthGlobalLayer {
    bucket: Arc<FixedTokenBucket>,
}

impl MaxBandwidthGlobalLayer {
    /// Create a layer with a fixed `max_bytes_per_second` budget.
    #[must_use]
    pub fn new(max_bytes_per_second: u64) -> Self {
        Self::from_fn(move || max_bytes_per_second)
    }

    /// Create a layer whose budget is re-read on every pacing decision.
    #[must_use]
    pub fn from_fn<F>(max_bytes_per_second: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self {
            bucket: pacing_bucket(max_bytes_per_second),
        }
    }
}

impl<S> Layer<S> for MaxBandwidthGlobalLayer {
    type Service = MaxBandwidthGlobalService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaxBandwidthGlobalService {
            inner,
            bucket: Arc::clone(&self.bucket),
        }
    }
}

/// Paces every body through the process-wide bucket.
#[derive(Debug, Clone)]
pub struct MaxBandwidthGlobalService<S> {
    inner: S,
    bucket: Arc<FixedTokenBucket>,
}

impl<S> Service<Request<Body>> for MaxBandwidthGlobalService<S>
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
        if self.bucket.capacity() == 0 {
            return Box::pin(self.inner.call(request));
        }

        let fut = self.inner.call(wrap_request(request, &self.bucket));
        let bucket = Arc::clone(&self.bucket);
        Box::pin(async move {
            let response = fut.await?;
            Ok(wrap_response(response, bucket))
        })
    }
}

// ---------------------------------------------------------------------------
// Per-request layer
// ---------------------------------------------------------------------------

/// Applies a fresh bandwidth budget to each exchange.
///
/// The limit is evaluated per request and the request and response bodies
/// of that exchange share one bucket; different requests never contend.
#[derive(Debug, Clone)]
pub struct MaxBandwidthLayer {
    limit: Provider<u64>,
}

impl MaxBandwidthLayer {
    /// Create a layer pacing each exchange at `max_bytes_per_second`.
    #[must_use]
    pub fn new(limit: impl Into<Provider<u64>>) -> Self {
        Self {
            limit: limit.into(),
        }
    }

    /// Create a layer whose rate is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(limit: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> u64 + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(limit))
    }
}

impl<S> Layer<S> for MaxBandwidthLayer {
    type Service = MaxBandwidthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaxBandwidthService {
            inner,
            limit: self.limit.clone(),
        }
    }
}

/// Paces each exchange through its own bucket.
#[derive(Debug, Clone)]
pub struct MaxBandwidthService<S> {
    inner: S,
    limit: Provider<u64>,
}

impl<S> Service<Request<Body>> for MaxBandwidthService<S>
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
        let rate = self.limit.get(RequestMeta::from_request(&request));
        if rate == 0 {
            return Box::pin(self.inner.call(request));
        }

        let bucket = pacing_bucket(move || rate);
        let fut = self.inner.call(wrap_request(request, &bucket));
        Box::pin(async move {
            let response = fut.await?;
            Ok(wrap_response(response, bucket))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU64, Ordering};

    use http_body_util::BodyExt;
    use tokio::time::Instant;
    use tower::ServiceExt;

    #[derive(Debug, Clone)]
    struct EchoService;

    impl Service<Request<Body>> for EchoService {
        type Response = Response;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: Request<Body>) -> Self::Future {
            Box::pin(async move {
                let collected = request.into_body().collect().await;
                match collected {
                    Ok(collected) => Ok(Response::new(Body::from(collected.to_bytes()))),
                    Err(_) => Ok(Response::new(Body::empty())),
                }
            })
        }
    }

    fn sixteen_byte_request() -> Request<Body> {
        Request::builder()
            .uri("/")
            .body(Body::from(vec![b'x'; 16]))
            .unwrap()
    }

    async fn run_exchange<S>(service: S, request: Request<Body>) -> Vec<u8>
    where
        S: Service<Request<Body>, Response = Response, Error = Infallible>,
    {
        let response = service.oneshot(request).await.unwrap();
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spreads_an_exchange_across_windows() {
        let service = MaxBandwidthGlobalLayer::new(16).layer(EchoService);
        let started = Instant::now();

        let echoed = run_exchange(service, sixteen_byte_request()).await;

        assert_eq!(echoed.len(), 16);
        // Each body spends one window on its data and one on the read that
        // discovers EOF, and both bodies drain the same bucket.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_exchanges_share_the_global_budget() {
        let layer = MaxBandwidthGlobalLayer::new(16);
        let started = Instant::now();

        let (a, b) = tokio::join!(
            run_exchange(layer.layer(EchoService), sixteen_byte_request()),
            run_exchange(layer.layer(EchoService), sixteen_byte_request()),
        );

        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 16);
        // Eight sixteen-token grants contend for one window sequence.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn per_request_buckets_pace_independently() {
        let layer = MaxBandwidthLayer::new(16u64);
        let started = Instant::now();

        let (a, b) = tokio::join!(
            run_exchange(layer.layer(EchoService), sixteen_byte_request()),
            run_exchange(layer.layer(EchoService), sixteen_byte_request()),
        );

        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 16);
        // Same workload as the shared-budget case, but each exchange has
        // its own bucket, so the two overlap fully.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_passes_bodies_untouched() {
        let service = MaxBandwidthGlobalLayer::new(0).layer(EchoService);
        let started = Instant::now();

        let request = Request::builder()
            .uri("/")
            .body(Body::from(vec![b'x'; 4096]))
            .unwrap();
        let echoed = run_exchange(service, request).await;

        assert_eq!(echoed.len(), 4096);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn per_request_rates_come_from_metadata() {
        let layer = MaxBandwidthLayer::per_request(|meta| {
            if meta.uri().path() == "/free" {
                0
            } else {
                16
            }
        });

        let started = Instant::now();
        let request = Request::builder()
            .uri("/free")
            .body(Body::from(vec![b'x'; 4096]))
            .unwrap();
        let echoed = run_exchange(layer.layer(EchoService), request).await;
        assert_eq!(echoed.len(), 4096);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = Instant::now();
        let echoed = run_exchange(layer.layer(EchoService), sixteen_byte_request()).await;
        assert_eq!(echoed.len(), 16);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_changes_apply_to_later_requests() {
        let rate = Arc::new(AtomicU64::new(0));
        let source = Arc::clone(&rate);
        let layer = MaxBandwidthGlobalLayer::from_fn(move || source.load(Ordering::SeqCst));

        let started = Instant::now();
        let echoed = run_exchange(layer.layer(EchoService), sixteen_byte_request()).await;
        assert_eq!(echoed.len(), 16);
        assert_eq!(started.elapsed(), Duration::ZERO);

        rate.store(16, Ordering::SeqCst);

        let started = Instant::now();
        let echoed = run_exchange(layer.layer(EchoService), sixteen_byte_request()).await;
        assert_eq!(echoed.len(), 16);
        // The raised rate only has tokens once the next window opens.
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }
}

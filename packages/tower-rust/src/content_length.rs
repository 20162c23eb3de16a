//! Request body size limiting middleware.
//!
//! The declared `Content-Length` is checked before the body is touched;
//! the body itself is wrapped with a byte ceiling so clients that lie
//! about the declaration (or send chunked bodies with no declaration at
//! all) are still stopped at the limit. Ceiling violations are observed
//! while the inner service reads the body and translated into a rejection
//! once it returns.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use flowguard_core::{CeilingExceeded, LimitedStream};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Request, StatusCode};
use tokio::io::{AsyncRead, ReadBuf};
use tower::{Layer, Service};

use crate::body::{reject, splice};
use crate::meta::{Provider, RequestMeta};

const PAYLOAD_TOO_LARGE: (StatusCode, &str) = (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
const LENGTH_REQUIRED: (StatusCode, &str) = (StatusCode::LENGTH_REQUIRED, "Length Required");

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// Applies [`MaxRequestContentLengthService`] to an inner service.
#[derive(Debug, Clone)]
pub struct MaxRequestContentLengthLayer {
    limit: Provider<u64>,
}

impl MaxRequestContentLengthLayer {
    /// Create a layer capping request bodies at `limit` bytes.
    #[must_use]
    pub fn new(limit: impl Into<Provider<u64>>) -> Self {
        Self {
            limit: limit.into(),
        }
    }

    /// Create a layer whose cap is derived from request metadata.
    #[must_use]
    pub fn per_request<F>(limit: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> u64 + Send + Sync + 'static,
    {
        Self::new(Provider::from_fn(limit))
    }
}

impl<S> Layer<S> for MaxRequestContentLengthLayer {
    type Service = MaxRequestContentLengthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MaxRequestContentLengthService {
            inner,
            limit: self.limit.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Rejects requests whose body exceeds the configured size.
///
/// `HEAD` requests are forwarded without any check. A missing
/// `Content-Length` on `POST`/`PUT`/`PATCH` is `411`; on other methods the
/// body is wrapped with a zero ceiling, so an undeclared body that does
/// arrive is also `411`. An unparsable declaration is `400`, a declaration
/// over the limit `413`, and everything else is wrapped at the limit to
/// catch under-declared bodies.
#[derive(Debug, Clone)]
pub struct MaxRequestContentLengthService<S> {
    inner: S,
    limit: Provider<u64>,
}

impl<S> Service<Request<Body>> for MaxRequestContentLengthService<S>
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
        if request.method() == Method::HEAD {
            tracing::debug!("HEAD request forwarded without a length check");
            return Box::pin(self.inner.call(request));
        }

        let max_bytes = self.limit.get(RequestMeta::from_request(&request));

        let (ceiling, violation) = match plan(&request, max_bytes) {
            LengthCheck::Reject(status, message) => {
                tracing::info!(
                    %status,
                    max_bytes,
                    declared = ?request.headers().get(CONTENT_LENGTH),
                    "request rejected on its declared length"
                );
                return Box::pin(async move { Ok(reject(status, message)) });
            }
            LengthCheck::Wrap { ceiling, violation } => (ceiling, violation),
        };

        let hook = ViolationHook::default();
        let observer = hook.clone();
        let (parts, body) = request.into_parts();
        let body = splice(body, move |reader| {
            ObservedReader::new(LimitedStream::new(reader, ceiling), observer)
        });

        let fut = self.inner.call(Request::from_parts(parts, body));
        Box::pin(async move {
            let response = fut.await?;
            if hook.fired() {
                let (status, message) = violation;
                tracing::info!(%status, max_bytes, "request body crossed its ceiling, rejecting");
                return Ok(reject(status, message));
            }
            Ok(response)
        })
    }
}

enum LengthCheck {
    Reject(StatusCode, &'static str),
    Wrap {
        ceiling: u64,
        violation: (StatusCode, &'static str),
    },
}

fn plan<B>(request: &Request<B>, max_bytes: u64) -> LengthCheck {
    if is_chunked(request.headers()) {
        return LengthCheck::Wrap {
            ceiling: max_bytes,
            violation: PAYLOAD_TOO_LARGE,
        };
    }

    let Some(raw) = request.headers().get(CONTENT_LENGTH) else {
        if expects_body(request.method()) {
            return LengthCheck::Reject(StatusCode::LENGTH_REQUIRED, LENGTH_REQUIRED.1);
        }
        // No declared body on a method that rarely carries one. Any byte
        // that shows up anyway counts as an undeclared length.
        return LengthCheck::Wrap {
            ceiling: 0,
            violation: LENGTH_REQUIRED,
        };
    };

    match raw.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        None => LengthCheck::Reject(StatusCode::BAD_REQUEST, "Bad Request"),
        Some(declared) if declared > max_bytes => {
            LengthCheck::Reject(StatusCode::PAYLOAD_TOO_LARGE, PAYLOAD_TOO_LARGE.1)
        }
        Some(_) => LengthCheck::Wrap {
            ceiling: max_bytes,
            violation: PAYLOAD_TOO_LARGE,
        },
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        })
}

fn expects_body(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH")
}

// ---------------------------------------------------------------------------
// Violation observation
// ---------------------------------------------------------------------------

/// Shared flag set when the wrapped body crosses its ceiling.
#[derive(Debug, Clone, Default)]
struct ViolationHook {
    fired: Arc<AtomicBool>,
}

impl ViolationHook {
    fn record(&self) {
        self.fired.store(true, Ordering::Release);
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Forwards reads and records ceiling violations as they pass by.
#[derive(Debug)]
struct ObservedReader<R> {
    inner: R,
    hook: ViolationHook,
}

impl<R> ObservedReader<R> {
    fn new(inner: R, hook: ViolationHook) -> Self {
        Self { inner, hook }
    }
}

impl<R> AsyncRead for ObservedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Err(err)) = &result {
            if CeilingExceeded::find(err).is_some() {
                self.hook.record();
            }
        }
        result
    }
}

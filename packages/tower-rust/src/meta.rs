//! Request metadata and per-request limit providers.
//!
//! Every guard takes its limit from a [`Provider`], either a constant or a
//! closure evaluated against the request line and headers. Closures are
//! re-run on every request, so a changed limit applies no later than the
//! next request without rebuilding the router.

use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, Method, Uri};

// ---------------------------------------------------------------------------
// RequestMeta
// ---------------------------------------------------------------------------

/// Borrowed view of a request's method, URI and headers.
///
/// This is what limit providers get to look at; the body stays untouched
/// until a guard decides to wrap it.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    method: &'a Method,
    uri: &'a Uri,
    headers: &'a HeaderMap,
}

impl<'a> RequestMeta<'a> {
    /// Borrow the metadata of `request`.
    #[must_use]
    pub fn from_request<B>(request: &'a http::Request<B>) -> Self {
        Self {
            method: request.method(),
            uri: request.uri(),
            headers: request.headers(),
        }
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        self.method
    }

    /// The request URI as received.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        self.uri
    }

    /// The request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Source of a limit value, re-read on every request.
pub struct Provider<V> {
    get: Arc<dyn Fn(RequestMeta<'_>) -> V + Send + Sync>,
}

impl<V> Provider<V> {
    /// A provider that derives the value from request metadata.
    pub fn from_fn<F>(get: F) -> Self
    where
        F: Fn(RequestMeta<'_>) -> V + Send + Sync + 'static,
    {
        Self { get: Arc::new(get) }
    }

    /// The value to apply to this request.
    #[must_use]
    pub fn get(&self, meta: RequestMeta<'_>) -> V {
        (self.get)(meta)
    }
}

impl<V> Provider<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A provider that always yields `value`.
    pub fn constant(value: V) -> Self {
        Self::from_fn(move |_| value.clone())
    }
}

impl<V> Clone for Provider<V> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
        }
    }
}

impl<V> fmt::Debug for Provider<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider").finish_non_exhaustive()
    }
}

impl<V> From<V> for Provider<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from(value: V) -> Self {
        Self::constant(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::Request;

    #[test]
    fn constant_provider_ignores_the_request() {
        let provider = Provider::constant(42u64);
        let request = Request::builder().uri("/a").body(()).unwrap();
        assert_eq!(provider.get(RequestMeta::from_request(&request)), 42);
    }

    #[test]
    fn fn_provider_sees_request_metadata() {
        let provider =
            Provider::from_fn(|meta| if meta.method() == Method::POST { 1u64 } else { 2 });

        let post = Request::builder()
            .method(Method::POST)
            .uri("/a")
            .body(())
            .unwrap();
        let get = Request::builder().uri("/a").body(()).unwrap();

        assert_eq!(provider.get(RequestMeta::from_request(&post)), 1);
        assert_eq!(provider.get(RequestMeta::from_request(&get)), 2);
    }

    #[test]
    fn plain_values_convert_into_providers() {
        let provider: Provider<u64> = 7u64.into();
        let request = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(provider.get(RequestMeta::from_request(&request)), 7);
    }
}

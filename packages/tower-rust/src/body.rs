//! Splicing stream decorators into HTTP bodies.
//!
//! Guards that act on payload bytes do not reimplement chunk handling;
//! they lower the body to `AsyncRead`, wrap it with a decorator from
//! `flowguard-core`, and lift the result back into a body. Decorator
//! errors surface as body stream errors on whichever side reads them.

use std::io;

use axum::body::{Body, BodyDataStream};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::MapErr;
use futures_util::TryStreamExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

/// An HTTP body viewed as a byte reader.
pub(crate) type BodyReader =
    StreamReader<MapErr<BodyDataStream, fn(axum::Error) -> io::Error>, Bytes>;

/// Rebuilds `body` around the reader decorator produced by `wrap`.
pub(crate) fn splice<R, F>(body: Body, wrap: F) -> Body
where
    F: FnOnce(BodyReader) -> R,
    R: AsyncRead + Send + 'static,
{
    let stream = body
        .into_data_stream()
        .map_err(stream_error_to_io as fn(axum::Error) -> io::Error);
    Body::from_stream(ReaderStream::new(wrap(StreamReader::new(stream))))
}

fn stream_error_to_io(err: axum::Error) -> io::Error {
    io::Error::other(err)
}

/// A plain-text rejection response, used by every guard that short-circuits.
pub(crate) fn reject(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(message.to_owned()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

//! Byte-ceiling stream decorator.
//!
//! Hard-caps the cumulative number of bytes a stream may transfer. The cap is
//! enforced mid-flight: the byte that would cross the ceiling fails the
//! operation, while everything up to the ceiling passes through untouched and
//! is never retracted.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Payload carried inside the [`io::Error`] raised when a stream crosses its
/// byte ceiling.
///
/// Adapters downcast to this type to tell a policy violation apart from a
/// transport failure:
///
/// ```
/// use flowguard_core::stream::CeilingExceeded;
///
/// let err = std::io::Error::other(CeilingExceeded { max_bytes: 4 });
/// assert!(CeilingExceeded::find(&err).is_some());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream exceeded the {max_bytes} byte ceiling")]
pub struct CeilingExceeded {
    /// The cumulative maximum this stream was allowed to transfer.
    pub max_bytes: u64,
}

impl CeilingExceeded {
    /// Returns the violation carried by `err`, if any.
    #[must_use]
    pub fn find(err: &io::Error) -> Option<&CeilingExceeded> {
        err.get_ref().and_then(|source| source.downcast_ref())
    }
}

/// Wraps a stream and fails the transfer at the exact byte that would push
/// the cumulative total past `max_bytes`.
///
/// Reads are clamped to the remaining quota, so the decorator never delivers
/// more than the ceiling. Once the quota is spent, the next read probes the
/// inner stream with a one-byte buffer: end-of-stream there is a clean EOF
/// (the transfer filled the ceiling exactly), one more byte is a violation.
/// Writes are truncated to the quota with ordinary partial-write semantics
/// and fail on the follow-up call that carries the excess.
///
/// A `max_bytes` of 0 permits no payload at all, which is how callers guard
/// requests that declared no length yet might still carry a body. The
/// violation rides inside the returned [`io::Error`]; see
/// [`CeilingExceeded::find`].
#[derive(Debug)]
pub struct LimitedStream<S> {
    inner: S,
    max_bytes: u64,
    transferred: u64,
}

impl<S> LimitedStream<S> {
    /// Wraps `inner` with a cumulative ceiling of `max_bytes`.
    #[must_use]
    pub fn new(inner: S, max_bytes: u64) -> Self {
        Self {
            inner,
            max_bytes,
            transferred: 0,
        }
    }

    /// Consumes the decorator, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Bytes forwarded so far. Never exceeds the ceiling.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    fn quota(&self) -> u64 {
        self.max_bytes - self.transferred
    }

    fn violation(&self) -> io::Error {
        tracing::debug!(max_bytes = self.max_bytes, "stream crossed its byte ceiling");
        io::Error::other(CeilingExceeded {
            max_bytes: self.max_bytes,
        })
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LimitedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let quota = this.quota();
        if quota == 0 {
            // Probe for the byte that would cross the line. EOF here means
            // the transfer ended exactly at the ceiling.
            let mut probe_byte = [0u8; 1];
            let mut probe = ReadBuf::new(&mut probe_byte);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut probe))?;
            return if probe.filled().is_empty() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Ready(Err(this.violation()))
            };
        }

        let len = usize::try_from(quota).unwrap_or(usize::MAX).min(buf.remaining());
        let window = buf.initialize_unfilled_to(len);
        let mut window = ReadBuf::new(window);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut window))?;

        let filled = window.filled().len();
        buf.advance(filled);
        this.transferred += filled as u64;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LimitedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        let quota = this.quota();
        if quota == 0 {
            return Poll::Ready(Err(this.violation()));
        }

        let len = usize::try_from(quota).unwrap_or(usize::MAX).min(buf.len());
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..len]))?;
        this.transferred += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

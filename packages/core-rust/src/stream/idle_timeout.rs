//! Idle-timeout stream decorator.
//!
//! Closes a transfer when a configurable gap passes with zero bytes moved.
//! Unlike a total-transfer deadline, the timer re-arms on every read or write
//! that makes progress, so an arbitrarily long transfer stays alive as long
//! as it keeps moving.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// Wraps a stream and fails pending or future I/O once `timeout` elapses
/// with no bytes transferred.
///
/// The deadline is owned by the stream and polled together with the inner
/// I/O: there is no detached timer that could fire after the stream is gone,
/// and dropping the decorator disposes the deadline with it. Expiry shows up
/// as [`io::ErrorKind::TimedOut`] on the operation in flight, and the stream
/// behaves as closed from then on; only shutdown is still forwarded so the
/// inner stream can be torn down.
///
/// Reads that return 0 bytes (end of stream) and flushes do not re-arm the
/// deadline; only actual payload movement counts as activity.
#[derive(Debug)]
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
}

impl<S> IdleTimeoutStream<S> {
    /// Wraps `inner`, arming the first deadline `timeout` from now.
    #[must_use]
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(sleep(timeout)),
            expired: false,
        }
    }

    /// Consumes the decorator, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// The configured idle gap.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn rearm(&mut self) {
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
    }

    /// Fails once the idle gap has elapsed, otherwise registers interest in
    /// the deadline so a stalled operation is woken when it fires.
    fn check_deadline(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.expired {
            return Err(idle_expired(self.timeout));
        }
        if self.deadline.as_mut().poll(cx).is_ready() {
            self.expired = true;
            tracing::info!(
                timeout_ms = self.timeout.as_millis() as u64,
                "stream idle for the full timeout, closing"
            );
            return Err(idle_expired(self.timeout));
        }
        Ok(())
    }
}

fn idle_expired(timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no stream activity within {timeout:?}"),
    )
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_deadline(cx)?;

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.rearm();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_deadline(cx)?;

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    this.rearm();
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(Err(idle_expired(this.timeout)));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Shutdown stays available after expiry: closing is exactly what an
        // expired stream wants.
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_deadline(cx)?;

        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    this.rearm();
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

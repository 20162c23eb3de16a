//! Bandwidth-throttling stream decorator.
//!
//! Paces transfers through a shared [`FixedTokenBucket`]: one token buys one
//! byte. A transfer the current window cannot cover is delayed until the next
//! refill, never rejected, so a throttled stream always finishes once enough
//! windows pass.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

use crate::bucket::{ConsumeOutcome, FixedTokenBucket};

/// Wraps a stream and spends one bucket token per transferred byte.
///
/// Each chunk is clamped to the bucket's current capacity before tokens are
/// requested, so a transfer larger than one window's budget is split across
/// windows instead of stalling forever. The bucket may be shared by many
/// streams (process-wide pacing) or private to one exchange.
///
/// When the provider behind the bucket reports capacity 0 the stream passes
/// bytes through without consuming tokens; that is the unlimited sentinel,
/// and adapters normally skip wrapping entirely in that case.
///
/// Tokens are requested for the chunk about to move. If the inner stream
/// accepts fewer bytes than were admitted, the difference stays as prepaid
/// credit for that direction and pays for its next bytes, so no byte is ever
/// paid for twice. Credit left when the stream ends is forfeited.
#[derive(Debug)]
pub struct ThrottledStream<S> {
    inner: S,
    bucket: Arc<FixedTokenBucket>,
    read_credit: usize,
    write_credit: usize,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    /// Wraps `inner`, pacing it through `bucket`.
    #[must_use]
    pub fn new(inner: S, bucket: Arc<FixedTokenBucket>) -> Self {
        Self {
            inner,
            bucket,
            read_credit: 0,
            write_credit: 0,
            read_delay: None,
            write_delay: None,
        }
    }

    /// Consumes the decorator, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// The bucket this stream draws from.
    #[must_use]
    pub fn bucket(&self) -> &Arc<FixedTokenBucket> {
        &self.bucket
    }
}

/// Waits out a pending pacing delay; `Ready` means tokens may be requested.
fn poll_delay(delay: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(sleeping) = delay.as_mut() {
        ready!(sleeping.as_mut().poll(cx));
        *delay = None;
    }
    Poll::Ready(())
}

/// Requests `wanted` tokens, clamped to `capacity`. Returns the admitted
/// chunk size, or arms `delay` for the bucket's wait hint and returns
/// `Pending`. A returned 0 means the refill was already due; the caller
/// should loop and consume from the fresh window.
fn poll_admit(
    bucket: &FixedTokenBucket,
    delay: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
    wanted: usize,
    capacity: usize,
) -> Poll<usize> {
    let chunk = wanted.min(capacity);
    match bucket.try_consume(chunk as u64) {
        ConsumeOutcome::Admitted => Poll::Ready(chunk),
        ConsumeOutcome::Throttled { retry_after } => {
            tracing::trace!(
                tokens = chunk,
                delay_ms = retry_after.as_millis() as u64,
                "transfer throttled until the next refill window"
            );
            let mut sleeping = Box::pin(sleep(retry_after));
            // Poll immediately so the waker is registered even though the
            // caller sees Pending from this call.
            if sleeping.as_mut().poll(cx).is_ready() {
                return Poll::Ready(0);
            }
            *delay = Some(sleeping);
            Poll::Pending
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            ready!(poll_delay(&mut this.read_delay, cx));

            let capacity = usize::try_from(this.bucket.capacity()).unwrap_or(usize::MAX);
            if capacity == 0 {
                return Pin::new(&mut this.inner).poll_read(cx, buf);
            }

            if this.read_credit == 0 {
                this.read_credit = ready!(poll_admit(
                    &this.bucket,
                    &mut this.read_delay,
                    cx,
                    buf.remaining(),
                    capacity,
                ));
                if this.read_credit == 0 {
                    continue;
                }
            }

            let len = this.read_credit.min(buf.remaining());
            let window = buf.initialize_unfilled_to(len);
            let mut window = ReadBuf::new(window);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut window))?;

            let filled = window.filled().len();
            buf.advance(filled);
            this.read_credit -= filled;
            return Poll::Ready(Ok(()));
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        loop {
            ready!(poll_delay(&mut this.write_delay, cx));

            let capacity = usize::try_from(this.bucket.capacity()).unwrap_or(usize::MAX);
            if capacity == 0 {
                return Pin::new(&mut this.inner).poll_write(cx, buf);
            }

            if this.write_credit == 0 {
                this.write_credit = ready!(poll_admit(
                    &this.bucket,
                    &mut this.write_delay,
                    cx,
                    buf.len(),
                    capacity,
                ));
                if this.write_credit == 0 {
                    continue;
                }
            }

            let len = this.write_credit.min(buf.len());
            let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..len]))?;
            this.write_credit -= written;
            return Poll::Ready(Ok(written));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::clock::ManualClock;

    const WINDOW: Duration = Duration::from_secs(1);

    fn paced_bucket(capacity: u64, clock: &ManualClock) -> Arc<FixedTokenBucket> {
        Arc::new(FixedTokenBucket::with_clock(
            move || capacity,
            WINDOW,
            Arc::new(clock.clone()),
        ))
    }

    /// Lets spawned tasks run until they block, then moves both the bucket
    /// clock and the tokio timer forward by one window.
    async fn roll_one_window(clock: &ManualClock) {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        clock.advance(WINDOW);
        tokio::time::advance(WINDOW).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_within_one_window_passes_immediately() {
        let clock = ManualClock::new();
        let bucket = paced_bucket(16, &clock);
        let (mut peer, wrapped) = tokio::io::duplex(64);
        let mut stream = ThrottledStream::new(wrapped, Arc::clone(&bucket));

        peer.write_all(b"0123456789").await.unwrap();

        let mut received = [0u8; 10];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"0123456789");
        assert_eq!(bucket.available(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_transfer_splits_across_windows() {
        let clock = ManualClock::new();
        let bucket = paced_bucket(4, &clock);
        let (mut peer, wrapped) = tokio::io::duplex(64);
        let mut stream = ThrottledStream::new(wrapped, Arc::clone(&bucket));

        let writer = tokio::spawn(async move {
            stream.write_all(&[7u8; 10]).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        // 10 bytes against a 4-byte window need two refills: 4 + 4 + 2.
        roll_one_window(&clock).await;
        roll_one_window(&clock).await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, [7u8; 10]);
        assert_eq!(bucket.available(), 2);

        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_reads_resume_after_the_refill() {
        let clock = ManualClock::new();
        let bucket = paced_bucket(4, &clock);
        let (mut peer, wrapped) = tokio::io::duplex(64);
        let mut stream = ThrottledStream::new(wrapped, Arc::clone(&bucket));

        peer.write_all(&[3u8; 6]).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut received = [0u8; 6];
            stream.read_exact(&mut received).await.unwrap();
            received
        });

        roll_one_window(&clock).await;

        assert_eq!(reader.await.unwrap(), [3u8; 6]);
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_means_no_pacing_at_all() {
        let clock = ManualClock::new();
        let bucket = paced_bucket(0, &clock);
        let (mut peer, wrapped) = tokio::io::duplex(64);
        let mut stream = ThrottledStream::new(wrapped, Arc::clone(&bucket));

        stream.write_all(&[1u8; 40]).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 40);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_writes_reuse_prepaid_credit() {
        let clock = ManualClock::new();
        let bucket = paced_bucket(8, &clock);
        // A two-byte pipe forces partial writes.
        let (wrapped, mut peer) = tokio::io::duplex(2);
        let mut stream = ThrottledStream::new(wrapped, Arc::clone(&bucket));

        let writer = tokio::spawn(async move {
            stream.write_all(&[5u8; 4]).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, [5u8; 4]);

        // Four bytes moved, four tokens spent: the admitted-but-unwritten
        // surplus paid for the second write instead of a fresh debit.
        assert_eq!(bucket.available(), 4);

        writer.await.unwrap();
    }
}

//! Per-session traffic accounting
//!
//! A [`SessionCounter`] holds the two directional byte counters for one
//! session plus the quota snapshot taken at authentication time. A
//! [`MeteredStream`] wraps the client-facing stream of a session and feeds
//! the counter: bytes read from the client count as upstream, bytes written
//! to the client count as downstream.
//!
//! Enforcement is deliberately one chunk late: the chunk that crosses the
//! limit is still delivered, and the *next* read or write on the stream
//! fails with a [`QuotaExhausted`] error. The relay owns both peer sockets,
//! so that error tears the whole session down at once.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Marker error carried inside the `io::Error` raised on quota exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExhausted;

impl fmt::Display for QuotaExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "traffic quota exhausted")
    }
}

impl std::error::Error for QuotaExhausted {}

/// Build the terminal error returned once the session limit is reached.
pub fn quota_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, QuotaExhausted)
}

/// Check whether an IO error is the quota-exhaustion signal.
pub fn is_quota_exhausted(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<QuotaExhausted>())
}

/// Byte counters for one session.
///
/// `base_used` is the account's stored `traffic_used` at session start; the
/// counter is authoritative for the session's lifetime and its delta is
/// merged back into the store by the flusher.
#[derive(Debug)]
pub struct SessionCounter {
    bytes_up: AtomicI64,
    bytes_down: AtomicI64,
    flushed: AtomicI64,
    base_used: i64,
    limit: i64,
}

impl SessionCounter {
    /// New counter for an account with `base_used` bytes already consumed
    /// out of `limit` (0 = unlimited).
    pub fn new(base_used: i64, limit: i64) -> Self {
        Self {
            bytes_up: AtomicI64::new(0),
            bytes_down: AtomicI64::new(0),
            flushed: AtomicI64::new(0),
            base_used,
            limit,
        }
    }

    /// Count bytes sent towards the upstream target.
    pub fn add_up(&self, n: usize) {
        self.bytes_up.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Count bytes sent back to the client.
    pub fn add_down(&self, n: usize) {
        self.bytes_down.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Bytes transferred towards the target so far.
    pub fn bytes_up(&self) -> i64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes transferred back to the client so far.
    pub fn bytes_down(&self) -> i64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Total bytes transferred in this session, both directions.
    pub fn session_total(&self) -> i64 {
        self.bytes_up() + self.bytes_down()
    }

    /// Whether the account limit has been reached.
    pub fn exhausted(&self) -> bool {
        self.limit > 0 && self.base_used + self.session_total() >= self.limit
    }

    /// Bytes accumulated since the last flush.
    ///
    /// The watermark advances with `fetch_max`, so racing flushes (the
    /// periodic flusher versus the end-of-session flush) can never bill the
    /// same bytes twice; a stale racer just reports zero.
    pub fn take_flush_delta(&self) -> i64 {
        let total = self.session_total();
        let previous = self.flushed.fetch_max(total, Ordering::AcqRel);
        (total - previous).max(0)
    }
}

/// Stream wrapper that meters one session's client connection.
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    counter: Arc<SessionCounter>,
}

impl<S> MeteredStream<S> {
    /// Wrap `inner`, accounting transfers against `counter`.
    pub fn new(inner: S, counter: Arc<SessionCounter>) -> Self {
        Self { inner, counter }
    }

    /// The session counter shared with the registry.
    pub fn counter(&self) -> &Arc<SessionCounter> {
        &self.counter
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.counter.exhausted() {
            return Poll::Ready(Err(quota_error()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.counter.add_up(n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.counter.exhausted() {
            return Poll::Ready(Err(quota_error()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.counter.add_down(n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
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
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_counter_totals() {
        let counter = SessionCounter::new(0, 0);
        counter.add_up(100);
        counter.add_down(50);
        assert_eq!(counter.bytes_up(), 100);
        assert_eq!(counter.bytes_down(), 50);
        assert_eq!(counter.session_total(), 150);
        assert!(!counter.exhausted());
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let counter = SessionCounter::new(i64::MAX / 2, 0);
        counter.add_up(1 << 30);
        assert!(!counter.exhausted());
    }

    #[test]
    fn test_exhaustion_counts_base_usage() {
        let counter = SessionCounter::new(1000, 1024);
        assert!(!counter.exhausted());
        counter.add_up(23);
        assert!(!counter.exhausted());
        counter.add_down(1);
        assert!(counter.exhausted());
    }

    #[test]
    fn test_flush_delta_watermark() {
        let counter = SessionCounter::new(0, 0);
        counter.add_up(100);
        assert_eq!(counter.take_flush_delta(), 100);
        assert_eq!(counter.take_flush_delta(), 0);

        counter.add_down(40);
        assert_eq!(counter.take_flush_delta(), 40);
        assert_eq!(counter.take_flush_delta(), 0);
    }

    #[test]
    fn test_quota_error_detection() {
        assert!(is_quota_exhausted(&quota_error()));
        let plain = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(!is_quota_exhausted(&plain));
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(!is_quota_exhausted(&eof));
    }

    #[tokio::test]
    async fn test_metered_read_counts_up() {
        let (mut far, near) = duplex(1024);
        let counter = Arc::new(SessionCounter::new(0, 0));
        let mut metered = MeteredStream::new(near, counter.clone());

        far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = metered.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(counter.bytes_up(), 5);
        assert_eq!(counter.bytes_down(), 0);
    }

    #[tokio::test]
    async fn test_metered_write_counts_down() {
        let (mut far, near) = duplex(1024);
        let counter = Arc::new(SessionCounter::new(0, 0));
        let mut metered = MeteredStream::new(near, counter.clone());

        metered.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 16];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(counter.bytes_down(), 5);
        assert_eq!(counter.bytes_up(), 0);
    }

    #[tokio::test]
    async fn test_crossing_chunk_is_delivered_then_cut() {
        let (mut far, near) = duplex(1024);
        let counter = Arc::new(SessionCounter::new(1000, 1024));
        let mut metered = MeteredStream::new(near, counter.clone());

        // 512 bytes cross the limit but must still go through.
        far.write_all(&[0xAB; 512]).await.unwrap();
        let mut buf = [0u8; 512];
        metered.read_exact(&mut buf).await.unwrap();
        assert!(counter.exhausted());

        // The next operation in either direction is the terminal signal.
        far.write_all(b"more").await.unwrap();
        let err = metered.read(&mut buf).await.unwrap_err();
        assert!(is_quota_exhausted(&err));
        let err = metered.write(b"reply").await.unwrap_err();
        assert!(is_quota_exhausted(&err));
    }

    #[tokio::test]
    async fn test_overshoot_is_at_most_one_chunk() {
        let (mut far, near) = duplex(8192);
        let counter = Arc::new(SessionCounter::new(1000, 1024));
        let mut metered = MeteredStream::new(near, counter.clone());

        let mut delivered = 0usize;
        let writer = tokio::spawn(async move {
            for _ in 0..8 {
                if far.write_all(&[0u8; 256]).await.is_err() {
                    break;
                }
            }
            drop(far);
        });

        let mut buf = [0u8; 256];
        loop {
            match metered.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => delivered += n,
                Err(err) => {
                    assert!(is_quota_exhausted(&err));
                    break;
                }
            }
        }
        writer.await.unwrap();

        // At least up to the limit, at most one extra chunk.
        assert!(delivered as i64 >= 1024 - 1000);
        assert!(delivered as i64 <= 1024 - 1000 + 256);
    }
}

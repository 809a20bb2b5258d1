//! Per-operation deadlines and cooperative cancellation over a duplex byte
//! stream, grounded on the cancel-then-deadline ordering of
//! `pkg/timeoutnet` in the original source: a cancellation check happens
//! *before* the wrapper ever touches the stream, then a deadline equal to
//! `now + configured_timeout` is applied to that single operation.
//!
//! Unlike a `BufReader`/`BufWriter`, this type never holds bytes across
//! calls — it is a pass-through, not a buffer.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn cancelled_err() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled")
}

fn timed_out_err() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

/// Wraps a single duplex stream (or a read/write half pair) with a shared
/// timeout and a shared cancellation handle. Cloning the token, not the
/// stream, is how two halves of the same connection learn about each
/// other's cancellation.
pub struct TimeoutIo<S> {
    inner: S,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<S> TimeoutIo<S> {
    pub fn new(inner: S, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner,
            timeout,
            cancel,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<S: AsyncRead + Unpin> TimeoutIo<S> {
    /// Reads into `buf`, returning the number of bytes read. `Ok(0)` means
    /// clean end-of-stream, matching `AsyncRead::read`'s convention.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_err());
        }
        match tokio::time::timeout(self.timeout, self.inner.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out_err()),
        }
    }

    /// Reads exactly `buf.len()` bytes, looping on short reads and folding
    /// per-call timeouts into the cancellation check on the next
    /// iteration. A clean end-of-stream with zero bytes read so far is
    /// reported by returning `Ok(0)`; a partial read followed by
    /// end-of-stream is truncation and reported as an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(cancelled_err());
            }
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(0);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated read",
                ));
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl<S: AsyncWrite + Unpin> TimeoutIo<S> {
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_err());
        }
        match tokio::time::timeout(self.timeout, self.inner.write(buf)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out_err()),
        }
    }

    /// Writes the entire buffer as one logical operation (the framer needs
    /// whole packets written atomically to the paired stream).
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_err());
        }
        match tokio::time::timeout(self.timeout, self.inner.write_all(buf)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out_err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_write_roundtrip() {
        let (client, mut server) = duplex(64);
        let cancel = CancellationToken::new();
        let mut io = TimeoutIo::new(client, Duration::from_secs(5), cancel);

        server.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = io.read_exact(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        io.write_all(b"world").await.unwrap();
        let mut out = [0u8; 5];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"world");
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_touching_stream() {
        let (client, _server) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut io = TimeoutIo::new(client, Duration::from_secs(5), cancel);
        let mut buf = [0u8; 5];
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_timeout_error() {
        let (client, _server) = duplex(64);
        let cancel = CancellationToken::new();
        let mut io = TimeoutIo::new(client, Duration::from_millis(10), cancel);
        let mut buf = [0u8; 5];
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}

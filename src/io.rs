//! Stream plumbing shared by sessions, consoles and the relay
//!
//! Session streams are wrapped in [`Guarded`] so that closing the session
//! (or its stdin side) unblocks any task still parked on a read or write.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Read half handed out by sessions and consoles
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half handed out by sessions and consoles
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Size of the relay buffer
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// A stream that ends as soon as its close token fires
///
/// Reads report EOF and writes fail with `BrokenPipe` once closed, even if a
/// read was already pending on the inner stream.
pub struct Guarded<S> {
    inner: S,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    is_closed: bool,
}

impl<S> Guarded<S> {
    /// Wrap `inner`, closing it when `token` is cancelled
    pub fn new(inner: S, token: &CancellationToken) -> Self {
        Self {
            inner,
            closed: Box::pin(token.clone().cancelled_owned()),
            is_closed: false,
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.is_closed && self.closed.as_mut().poll(cx).is_ready() {
            self.is_closed = true;
        }
        self.is_closed
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Guarded<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Guarded<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Copy `reader` into `writer` until EOF, flushing after every chunk
///
/// Bytes are forwarded in the order read with no buffering beyond one chunk.
/// Returns the number of bytes relayed.
pub async fn relay<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_relay_copies_in_order() {
        let input: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut output = Vec::new();

        let n = relay(&input[..], &mut output).await.unwrap();
        assert_eq!(n, input.len() as u64);
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_guarded_read_ends_on_close() {
        let (_peer, stream) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let mut guarded = Guarded::new(stream, &token);

        let closer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closer.cancel();
        });

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), guarded.read(&mut buf))
            .await
            .expect("pending read should be released by close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_guarded_write_fails_after_close() {
        let (_peer, stream) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let mut guarded = Guarded::new(stream, &token);

        guarded.write_all(b"before").await.unwrap();
        token.cancel();
        let err = guarded.write_all(b"after").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}

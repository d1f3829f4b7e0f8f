//! POSIX console support
//!
//! Raw mode is plain termios on stdin. Resize notifications come from
//! `SIGWINCH`. Standard input is read on a dedicated thread that polls with a
//! short timeout, so closing input takes effect without waiting for a key press.

use std::fmt;
use std::io;
use std::io::IsTerminal;
use std::os::fd::AsFd;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::thread;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{InputThread, ResizeNotifier};
use crate::error::{Error, Result};
use crate::io::{BoxedReader, Guarded, RELAY_BUFFER_SIZE};
use crate::pty::{self, TerminalSize};

/// How often the input thread re-checks whether it has been closed
const POLL_INTERVAL_MS: libc::c_int = 100;

/// Chunks buffered between the input thread and its reader
const INPUT_BACKLOG: usize = 16;

/// termios captured by `make_raw`
pub(crate) struct SavedMode {
    fd: libc::c_int,
    termios: libc::termios,
}

impl fmt::Debug for SavedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedMode")
            .field("fd", &self.fd)
            .finish_non_exhaustive()
    }
}

pub(crate) fn make_raw() -> Result<SavedMode> {
    if !io::stdin().is_terminal() {
        return Err(Error::NotAConsole);
    }
    let fd = libc::STDIN_FILENO;

    // SAFETY: termios is plain data; tcgetattr fully initializes it on success.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: valid descriptor and out-pointer.
    if unsafe { libc::tcgetattr(fd, &mut termios) } == -1 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let mut raw = termios;
    // SAFETY: raw is an initialized termios.
    unsafe { libc::cfmakeraw(&mut raw) };
    // SAFETY: valid descriptor and termios.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } == -1 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(SavedMode { fd, termios })
}

pub(crate) fn restore(saved: &SavedMode) -> io::Result<()> {
    // SAFETY: the saved termios came from tcgetattr on this descriptor.
    if unsafe { libc::tcsetattr(saved.fd, libc::TCSANOW, &saved.termios) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn terminal_size() -> Option<TerminalSize> {
    let stdout = io::stdout();
    pty::get_winsize(stdout.as_fd())
        .ok()
        .filter(TerminalSize::is_valid)
}

/// Nothing to negotiate: POSIX terminals interpret escape sequences natively
pub(crate) fn enable_virtual_terminal() {}

/// Forward `SIGWINCH` to `notifier` until `stop` fires
///
/// The notifier is dropped when the task ends, which ends the event stream.
pub(crate) fn watch_resize(notifier: ResizeNotifier, stop: CancellationToken) -> Result<()> {
    let mut signals = signal(SignalKind::window_change())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = signals.recv() => match received {
                    Some(()) => notifier.notify(),
                    None => break,
                },
            }
        }
        debug!("resize watcher stopped");
    });
    Ok(())
}

/// Async reader over standard input that ends when `closed` fires
///
/// The returned [`InputThread`] exits within one poll interval of `closed`
/// firing.
pub(crate) fn stdin_reader(closed: CancellationToken) -> (BoxedReader, InputThread) {
    let (tx, rx) = mpsc::channel(INPUT_BACKLOG);
    let pump_closed = closed.clone();
    let spawned = thread::Builder::new()
        .name("ptyx-stdin".into())
        .spawn(move || pump_stdin(tx, pump_closed));
    let thread = match spawned {
        Ok(handle) => InputThread::new(handle),
        Err(e) => {
            // The reader sees EOF immediately since the sender is gone.
            debug!("failed to start stdin thread: {}", e);
            InputThread::none()
        }
    };
    let reader = Box::new(Guarded::new(
        ChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
        &closed,
    ));
    (reader, thread)
}

fn pump_stdin(tx: mpsc::Sender<Vec<u8>>, closed: CancellationToken) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    while !closed.is_cancelled() && !tx.is_closed() {
        let mut fds = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut fds, 1, POLL_INTERVAL_MS) };
        if ready == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            debug!("stdin poll failed: {}", err);
            break;
        }
        if ready == 0 || closed.is_cancelled() {
            continue;
        }

        // SAFETY: buf is a live buffer of the given length.
        let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ) {
                continue;
            }
            debug!("stdin read failed: {}", err);
            break;
        }
        if n == 0 {
            break;
        }
        if tx.blocking_send(buf[..n as usize].to_vec()).is_err() {
            break;
        }
    }
    debug!("stdin thread finished");
}

/// Adapts a channel of byte chunks to `AsyncRead`
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset >= this.pending.len() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                None => return Poll::Ready(Ok(())),
            }
        }

        let available = &this.pending[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_channel_reader_splits_chunks() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = ChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        };
        tx.send(b"hello world".to_vec()).await.unwrap();
        drop(tx);

        let mut first = [0u8; 5];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"hello");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" world");
    }

    #[tokio::test]
    async fn test_stdin_thread_joins_after_close() {
        let closed = CancellationToken::new();
        let (reader, thread) = stdin_reader(closed.clone());
        closed.cancel();
        drop(reader);

        tokio::time::timeout(std::time::Duration::from_secs(2), thread.join())
            .await
            .expect("stdin thread should exit once closed");
    }

    #[test]
    fn test_make_raw_requires_terminal() {
        if !io::stdin().is_terminal() {
            assert!(make_raw().unwrap_err().is_not_a_console());
        }
    }
}

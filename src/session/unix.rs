//! POSIX sessions
//!
//! The child is started in a new session with the peripheral as its
//! controlling terminal and all three standard streams. A single exit-watcher
//! task owns the `Child`: it either observes the natural exit or, when the
//! kill token fires, sends `SIGKILL` and reaps. Nothing else touches the
//! process, so `kill` and `wait` never race on the pid.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{wait_for_exit, Outcome, Session, SpawnOptions};
use crate::error::{Error, ExitError, RawStatus, Result, KILLED_EXIT_CODE};
use crate::io::{BoxedReader, BoxedWriter, Guarded};
use crate::lifecycle::Lifecycle;
use crate::pty::{self, PtyStream, TerminalSize};

/// `^D`, used when the terminal reports no VEOF character
const DEFAULT_VEOF: u8 = 0x04;

/// A child process running on a POSIX pseudo-terminal
pub struct PtySession {
    id: Uuid,
    pid: u32,
    program: String,
    /// Controller endpoint, `None` once closed
    controller: Mutex<Option<Arc<OwnedFd>>>,
    /// Fires on `close`; ends every reader and writer
    closed: CancellationToken,
    /// Child of `closed`; fires on `close_stdin`
    stdin_closed: CancellationToken,
    /// Fires on `kill`, `close` or cancellation of the spawn token
    kill: CancellationToken,
    lifecycle: Lifecycle,
    stdin: Lifecycle,
    exit: watch::Receiver<Option<Outcome>>,
    /// Last byte written through any writer, `\n` before the first write
    last_written: Arc<AtomicU8>,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session is closed")
}

/// Map a wait status to the session outcome
fn outcome(status: ExitStatus) -> Outcome {
    if let Some(signal) = status.signal() {
        return Err(ExitError::new(
            KILLED_EXIT_CODE,
            RawStatus::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            },
        ));
    }
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ExitError::new(code, RawStatus::Exited(code))),
        None => Err(ExitError::new(
            KILLED_EXIT_CODE,
            RawStatus::Exited(KILLED_EXIT_CODE),
        )),
    }
}

/// Bytes that tell the child its input has ended
///
/// In canonical mode the first VEOF after a partial line only hands that line
/// to the reader, so a second one is needed for the read that reports EOF.
fn eof_sequence(fd: BorrowedFd<'_>, last_written: u8) -> Vec<u8> {
    // SAFETY: termios is plain data; tcgetattr fully initializes it on success.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: live descriptor and a valid out-pointer.
    if unsafe { libc::tcgetattr(fd.as_raw_fd(), &mut termios) } == -1 {
        return vec![DEFAULT_VEOF];
    }
    let veof = match termios.c_cc[libc::VEOF] {
        0 => DEFAULT_VEOF,
        c => c,
    };
    let canonical = (termios.c_lflag & libc::ICANON) != 0;
    if canonical && !ends_line(&termios, veof, last_written) {
        vec![veof, veof]
    } else {
        vec![veof]
    }
}

/// Whether `byte`, written last, left the line discipline with no pending line
fn ends_line(termios: &libc::termios, veof: u8, byte: u8) -> bool {
    let veol = termios.c_cc[libc::VEOL];
    byte == b'\n'
        || byte == veof
        || (byte == b'\r' && (termios.c_iflag & libc::ICRNL) != 0)
        || (veol != 0 && byte == veol)
}

/// Write all of `bytes` to a non-blocking descriptor, giving up on `EAGAIN`
fn write_fd(fd: BorrowedFd<'_>, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        // SAFETY: live buffer of the given length on a live descriptor.
        let n = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

/// Writer that remembers the last byte accepted by the pty
struct LastByte<W> {
    inner: W,
    last: Arc<AtomicU8>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LastByte<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if n > 0 {
            this.last.store(buf[n - 1], Ordering::SeqCst);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl PtySession {
    pub(crate) fn spawn(token: &CancellationToken, options: SpawnOptions) -> Result<Self> {
        let size = options.size.or_default();
        let mut pair = pty::allocate(size)?;

        let (Some(controller), Some(peripheral)) = (pair.take_controller(), pair.take_peripheral())
        else {
            return Err(Error::allocation(
                "take(endpoints)",
                io::Error::new(io::ErrorKind::NotConnected, "pty pair is incomplete"),
            ));
        };
        debug!(
            "spawning '{}' on {}",
            options.program,
            pair.peripheral_path().display()
        );

        let mut command = Command::new(&options.program);
        command.args(&options.args);
        if let Some(env) = &options.env {
            command.env_clear().envs(env);
        }
        if let Some(dir) = &options.dir {
            command.current_dir(dir);
        }

        let stdin = peripheral
            .try_clone()
            .map_err(|e| Error::spawn(&options.program, e))?;
        let stdout = peripheral
            .try_clone()
            .map_err(|e| Error::spawn(&options.program, e))?;
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(peripheral));

        // SAFETY: only async-signal-safe calls between fork and exec. Stdio has
        // already been bound, so fd 0 is the peripheral.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::spawn(&options.program, e))?;
        // Only the child needs the peripheral from here on.
        drop(command);

        let pid = child.id().unwrap_or(0);
        info!("spawned '{}' (pid {})", options.program, pid);

        let kill = token.child_token();
        let (exit_tx, exit_rx) = watch::channel(None);

        let watcher_kill = kill.clone();
        let program = options.program.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = watcher_kill.cancelled() => {
                    debug!("killing '{}' (pid {})", program, pid);
                    if let Err(e) = child.start_kill() {
                        debug!("kill of pid {} failed: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(status) => outcome(status),
                Err(e) => {
                    warn!("failed to reap pid {}: {}", pid, e);
                    Err(ExitError::new(
                        KILLED_EXIT_CODE,
                        RawStatus::Exited(KILLED_EXIT_CODE),
                    ))
                }
            };
            match &outcome {
                Ok(()) => debug!("'{}' (pid {}) exited cleanly", program, pid),
                Err(exit) => debug!("'{}' (pid {}) {}", program, pid, exit),
            }
            let _ = exit_tx.send(Some(outcome));
        });

        let closed = CancellationToken::new();
        let stdin_closed = closed.child_token();

        Ok(Self {
            id: Uuid::new_v4(),
            pid,
            program: options.program,
            controller: Mutex::new(Some(Arc::new(controller))),
            closed,
            stdin_closed,
            kill,
            lifecycle: Lifecycle::running(),
            stdin: Lifecycle::running(),
            exit: exit_rx,
            last_written: Arc::new(AtomicU8::new(b'\n')),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<OwnedFd>>> {
        self.controller.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The controller, cloned out so no lock is held while using it
    fn controller(&self) -> Option<Arc<OwnedFd>> {
        self.lock().clone()
    }

    fn stream(&self) -> io::Result<PtyStream> {
        let controller = self.controller().ok_or_else(not_connected)?;
        PtyStream::new(controller.try_clone()?)
    }
}

#[async_trait]
impl Session for PtySession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn reader(&self) -> io::Result<BoxedReader> {
        Ok(Box::new(Guarded::new(self.stream()?, &self.closed)))
    }

    fn writer(&self) -> io::Result<BoxedWriter> {
        let writer = LastByte {
            inner: self.stream()?,
            last: self.last_written.clone(),
        };
        Ok(Box::new(Guarded::new(writer, &self.stdin_closed)))
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        match self.controller() {
            Some(fd) => pty::set_winsize(fd.as_fd(), size).map_err(Error::Io),
            None => Ok(()),
        }
    }

    fn size(&self) -> Result<TerminalSize> {
        let fd = self.controller().ok_or_else(not_connected)?;
        pty::get_winsize(fd.as_fd()).map_err(Error::Io)
    }

    async fn wait(&self) -> Result<()> {
        wait_for_exit(&self.exit).await
    }

    fn kill(&self) -> Result<()> {
        if !self.kill.is_cancelled() {
            info!("kill requested for '{}' (pid {})", self.program, self.pid);
            self.kill.cancel();
        }
        Ok(())
    }

    /// Sends the terminal's EOF character, then refuses further writes.
    /// A pty has no half-close, so this is what the line discipline offers.
    fn close_stdin(&self) -> Result<()> {
        if !self.stdin.stop() {
            return Ok(());
        }
        if let Some(fd) = self.controller() {
            let eof = eof_sequence(fd.as_fd(), self.last_written.load(Ordering::SeqCst));
            if let Err(e) = write_fd(fd.as_fd(), &eof) {
                debug!("failed to send EOF to pid {}: {}", self.pid, e);
            }
        }
        self.stdin_closed.cancel();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        debug!("closing session {} (pid {})", self.id, self.pid);
        self.kill.cancel();
        self.closed.cancel();
        self.lock().take();
        Ok(())
    }
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

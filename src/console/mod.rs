//! Host console access
//!
//! Wraps the process's own standard streams when stdout is a real terminal:
//! raw-mode switching with restore tokens, geometry queries, resize
//! notifications and (on Windows) virtual-terminal negotiation.
//!
//! [`SystemConsole::open`] fails with [`Error::NotAConsole`] when stdout is
//! not a terminal; callers branch on that to pick a plain stream-copy path.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

pub(crate) use sys::stdin_reader;

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::io::{BoxedReader, BoxedWriter};
use crate::lifecycle::Lifecycle;
use crate::pty::TerminalSize;

/// Source of console ids, so restore tokens can be matched to their console
static NEXT_CONSOLE_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal mode captured before switching to raw mode
///
/// Only the console that produced a token can restore it; anything else,
/// including [`RawState::none`], is ignored by [`Console::restore`].
#[derive(Debug)]
pub struct RawState {
    owner: u64,
    saved: Option<sys::SavedMode>,
}

impl RawState {
    /// A token that restores nothing
    pub fn none() -> Self {
        Self {
            owner: 0,
            saved: None,
        }
    }

    pub fn is_none(&self) -> bool {
        self.saved.is_none()
    }
}

/// The thread feeding a standard-input reader
#[derive(Debug)]
pub(crate) struct InputThread {
    handle: Option<JoinHandle<()>>,
}

impl InputThread {
    #[cfg_attr(windows, allow(dead_code))]
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub(crate) fn none() -> Self {
        Self { handle: None }
    }

    /// Wait for the thread to exit. Its close token must already have fired.
    pub(crate) async fn join(self) {
        let Some(handle) = self.handle else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => debug!("stdin thread joined"),
            Ok(Err(_)) => warn!("stdin thread panicked"),
            Err(e) => warn!("failed to join stdin thread: {}", e),
        }
    }
}

/// Sending side of a coalescing resize notification stream
#[derive(Debug, Clone)]
pub(crate) struct ResizeNotifier {
    tx: mpsc::Sender<()>,
}

impl ResizeNotifier {
    /// Queue a notification unless one is already pending
    pub(crate) fn notify(&self) {
        // Full or closed both mean there is nothing more to do.
        let _ = self.tx.try_send(());
    }
}

/// Stream of "the terminal size may have changed" notifications
///
/// Holds at most one pending notification; bursts collapse into one. Ends
/// when the console is closed.
#[derive(Debug)]
pub struct ResizeEvents {
    rx: Option<mpsc::Receiver<()>>,
}

impl ResizeEvents {
    /// A stream that has already ended
    pub fn closed() -> Self {
        Self { rx: None }
    }

    /// Next notification, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<()> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

/// Create a notifier and its single-slot event stream
pub(crate) fn resize_channel() -> (ResizeNotifier, ResizeEvents) {
    let (tx, rx) = mpsc::channel(1);
    (ResizeNotifier { tx }, ResizeEvents { rx: Some(rx) })
}

/// A host terminal
pub trait Console: Send + Sync {
    /// Take the input stream. Returns `None` after the first call.
    fn input(&self) -> Option<BoxedReader>;

    /// Take the output stream. Returns `None` after the first call.
    fn output(&self) -> Option<BoxedWriter>;

    /// Release any task blocked reading input. Idempotent.
    fn close_input(&self);

    fn output_is_terminal(&self) -> bool;

    fn error_is_terminal(&self) -> bool;

    /// Current geometry, `0x0` when it cannot be determined
    fn size(&self) -> TerminalSize;

    /// Switch input to raw mode, returning a token that undoes it
    fn make_raw(&self) -> Result<RawState>;

    /// Undo a [`make_raw`](Console::make_raw). Null or foreign tokens are ignored.
    fn restore(&self, state: RawState) -> Result<()>;

    /// Turn on ANSI escape processing where the platform needs it to be asked for
    fn enable_virtual_terminal(&self);

    /// Take the resize notification stream. Later calls get an ended stream.
    fn on_resize(&self) -> ResizeEvents;

    /// Stop the resize watcher and close input. Idempotent.
    fn close(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The console attached to this process's standard streams
pub struct SystemConsole {
    id: u64,
    input: Mutex<Option<BoxedReader>>,
    output: Mutex<Option<BoxedWriter>>,
    input_closed: CancellationToken,
    input_thread: Mutex<Option<InputThread>>,
    resize: Mutex<Option<ResizeEvents>>,
    watcher: CancellationToken,
    output_tty: bool,
    error_tty: bool,
    lifecycle: Lifecycle,
}

impl SystemConsole {
    /// Open the console, starting its resize watcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn open() -> Result<Self> {
        if !std::io::stdout().is_terminal() {
            return Err(Error::NotAConsole);
        }

        let input_closed = CancellationToken::new();
        let watcher = CancellationToken::new();
        let (notifier, events) = resize_channel();
        sys::watch_resize(notifier, watcher.clone())?;

        let (input, input_thread) = sys::stdin_reader(input_closed.clone());
        let console = Self {
            id: NEXT_CONSOLE_ID.fetch_add(1, Ordering::Relaxed),
            input: Mutex::new(Some(input)),
            output: Mutex::new(Some(Box::new(tokio::io::stdout()))),
            input_closed,
            input_thread: Mutex::new(Some(input_thread)),
            resize: Mutex::new(Some(events)),
            watcher,
            output_tty: true,
            error_tty: std::io::stderr().is_terminal(),
            lifecycle: Lifecycle::running(),
        };
        console.enable_virtual_terminal();
        debug!("console {} opened", console.id);
        Ok(console)
    }

    /// Take the input thread so it can be joined after [`Console::close`]
    pub(crate) fn take_input_thread(&self) -> Option<InputThread> {
        lock(&self.input_thread).take()
    }
}

/// Open the console attached to the standard streams
pub fn open_console() -> Result<SystemConsole> {
    SystemConsole::open()
}

impl Console for SystemConsole {
    fn input(&self) -> Option<BoxedReader> {
        lock(&self.input).take()
    }

    fn output(&self) -> Option<BoxedWriter> {
        lock(&self.output).take()
    }

    fn close_input(&self) {
        self.input_closed.cancel();
    }

    fn output_is_terminal(&self) -> bool {
        self.output_tty
    }

    fn error_is_terminal(&self) -> bool {
        self.error_tty
    }

    fn size(&self) -> TerminalSize {
        sys::terminal_size().unwrap_or(TerminalSize::new(0, 0))
    }

    fn make_raw(&self) -> Result<RawState> {
        let saved = sys::make_raw()?;
        debug!("console {} switched to raw mode", self.id);
        Ok(RawState {
            owner: self.id,
            saved: Some(saved),
        })
    }

    fn restore(&self, state: RawState) -> Result<()> {
        let Some(saved) = state.saved else {
            return Ok(());
        };
        if state.owner != self.id {
            warn!(
                "ignoring raw state from console {} on console {}",
                state.owner, self.id
            );
            return Ok(());
        }
        sys::restore(&saved)?;
        debug!("console {} restored", self.id);
        Ok(())
    }

    fn enable_virtual_terminal(&self) {
        sys::enable_virtual_terminal();
    }

    fn on_resize(&self) -> ResizeEvents {
        lock(&self.resize).take().unwrap_or_else(ResizeEvents::closed)
    }

    fn close(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        self.watcher.cancel();
        self.input_closed.cancel();
        debug!("console {} closed", self.id);
        Ok(())
    }
}

impl Drop for SystemConsole {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_resize_notifications_coalesce() {
        let (notifier, mut events) = resize_channel();
        for _ in 0..10 {
            notifier.notify();
        }

        assert_eq!(events.recv().await, Some(()));
        // The burst collapsed into a single pending notification.
        assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());

        notifier.notify();
        assert_eq!(events.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_resize_stream_ends_when_notifier_dropped() {
        let (notifier, mut events) = resize_channel();
        drop(notifier);
        assert_eq!(events.recv().await, None);
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_notify_after_consumer_gone_does_not_block() {
        let (notifier, events) = resize_channel();
        drop(events);
        notifier.notify();
        notifier.notify();
    }

    #[tokio::test]
    async fn test_closed_stream_ends_immediately() {
        let mut events = ResizeEvents::closed();
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn test_null_raw_state() {
        assert!(RawState::none().is_none());
    }

    #[tokio::test]
    async fn test_open_matches_stdout_terminal() {
        match SystemConsole::open() {
            Ok(console) => {
                assert!(std::io::stdout().is_terminal());
                // Null and foreign tokens are no-ops.
                console.restore(RawState::none()).unwrap();
                let foreign = RawState {
                    owner: u64::MAX,
                    saved: None,
                };
                console.restore(foreign).unwrap();

                let mut events = console.on_resize();
                console.close().unwrap();
                console.close().unwrap();
                let ended = timeout(Duration::from_secs(2), events.recv())
                    .await
                    .expect("resize stream should end on close");
                assert_eq!(ended, None);
            }
            Err(err) => {
                assert!(err.is_not_a_console());
                assert!(!std::io::stdout().is_terminal());
            }
        }
    }
}

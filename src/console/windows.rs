//! Windows console support
//!
//! Console modes stand in for termios. There is no resize signal, so the
//! watcher ticks on a fixed interval and the consumer re-reads the size.

use std::io;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Console::{
    GetConsoleMode, GetConsoleScreenBufferInfo, GetStdHandle, SetConsoleMode,
    CONSOLE_SCREEN_BUFFER_INFO, DISABLE_NEWLINE_AUTO_RETURN, ENABLE_ECHO_INPUT,
    ENABLE_LINE_INPUT, ENABLE_PROCESSED_INPUT, ENABLE_PROCESSED_OUTPUT,
    ENABLE_VIRTUAL_TERMINAL_INPUT, ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_ERROR_HANDLE,
    STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};

use super::{InputThread, ResizeNotifier};
use crate::error::{Error, Result};
use crate::io::{BoxedReader, Guarded};
use crate::pty::TerminalSize;

/// Interval between resize ticks
const RESIZE_POLL: Duration = Duration::from_millis(200);

/// Console mode captured by `make_raw`
#[derive(Debug)]
pub(crate) struct SavedMode {
    handle: HANDLE,
    mode: u32,
}

fn console_mode(handle: HANDLE) -> Option<u32> {
    let mut mode = 0;
    // SAFETY: valid out-pointer; an invalid handle just fails the call.
    (unsafe { GetConsoleMode(handle, &mut mode) } != 0).then_some(mode)
}

fn set_console_mode(handle: HANDLE, mode: u32) -> io::Result<()> {
    // SAFETY: plain call on a standard handle.
    if unsafe { SetConsoleMode(handle, mode) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn std_handle(which: u32) -> HANDLE {
    // SAFETY: GetStdHandle has no preconditions.
    unsafe { GetStdHandle(which) }
}

pub(crate) fn make_raw() -> Result<SavedMode> {
    let handle = std_handle(STD_INPUT_HANDLE);
    let mode = console_mode(handle).ok_or(Error::NotAConsole)?;

    let raw = (mode
        & !(ENABLE_ECHO_INPUT | ENABLE_PROCESSED_INPUT | ENABLE_LINE_INPUT | ENABLE_PROCESSED_OUTPUT))
        | ENABLE_VIRTUAL_TERMINAL_INPUT;
    set_console_mode(handle, raw)?;
    Ok(SavedMode { handle, mode })
}

pub(crate) fn restore(saved: &SavedMode) -> io::Result<()> {
    set_console_mode(saved.handle, saved.mode)
}

pub(crate) fn terminal_size() -> Option<TerminalSize> {
    // SAFETY: plain-data struct, all-zero is a valid initial value.
    let mut info: CONSOLE_SCREEN_BUFFER_INFO = unsafe { std::mem::zeroed() };
    // SAFETY: valid out-pointer; an invalid handle just fails the call.
    if unsafe { GetConsoleScreenBufferInfo(std_handle(STD_OUTPUT_HANDLE), &mut info) } == 0 {
        return None;
    }
    let window = info.srWindow;
    let cols = (window.Right - window.Left + 1).max(0) as u16;
    let rows = (window.Bottom - window.Top + 1).max(0) as u16;
    Some(TerminalSize::new(cols, rows)).filter(TerminalSize::is_valid)
}

/// Turn on ANSI escape processing for stdout and stderr
pub(crate) fn enable_virtual_terminal() {
    for which in [STD_OUTPUT_HANDLE, STD_ERROR_HANDLE] {
        let handle = std_handle(which);
        if let Some(mode) = console_mode(handle) {
            let vt = mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING | DISABLE_NEWLINE_AUTO_RETURN;
            if let Err(e) = set_console_mode(handle, vt) {
                debug!("failed to enable virtual terminal processing: {}", e);
            }
        }
    }
}

/// Tick `notifier` every [`RESIZE_POLL`] until `stop` fires
pub(crate) fn watch_resize(notifier: ResizeNotifier, stop: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RESIZE_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => notifier.notify(),
            }
        }
        debug!("resize watcher stopped");
    });
    Ok(())
}

/// tokio reads stdin on its blocking pool, so there is no thread of our own
pub(crate) fn stdin_reader(closed: CancellationToken) -> (BoxedReader, InputThread) {
    let reader = Box::new(Guarded::new(tokio::io::stdin(), &closed));
    (reader, InputThread::none())
}

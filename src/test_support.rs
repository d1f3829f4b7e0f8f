//! In-memory console and session doubles backed by `tokio::io::duplex`

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::console::{Console, RawState, ResizeEvents};
use crate::error::Result;
use crate::io::{BoxedReader, BoxedWriter, Guarded};
use crate::pty::TerminalSize;
use crate::session::Session;

const PIPE_CAPACITY: usize = 64 * 1024;

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap().take()
}

/// Console whose keyboard and screen are in-memory pipes
pub(crate) struct MockConsole {
    input: Mutex<Option<BoxedReader>>,
    output: Mutex<Option<BoxedWriter>>,
    input_closed: CancellationToken,
    pub close_input_calls: AtomicUsize,
}

/// Test-side ends of a [`MockConsole`]
pub(crate) struct ConsoleEnds {
    /// Bytes written here are read from the console input
    pub keys: DuplexStream,
    /// Bytes written to the console output arrive here
    pub screen: DuplexStream,
}

pub(crate) fn mock_console() -> (MockConsole, ConsoleEnds) {
    let (keys, console_in) = tokio::io::duplex(PIPE_CAPACITY);
    let (screen, console_out) = tokio::io::duplex(PIPE_CAPACITY);
    let input_closed = CancellationToken::new();
    let console = MockConsole {
        input: Mutex::new(Some(Box::new(Guarded::new(console_in, &input_closed)))),
        output: Mutex::new(Some(Box::new(console_out))),
        input_closed,
        close_input_calls: AtomicUsize::new(0),
    };
    (console, ConsoleEnds { keys, screen })
}

impl Console for MockConsole {
    fn input(&self) -> Option<BoxedReader> {
        take(&self.input)
    }

    fn output(&self) -> Option<BoxedWriter> {
        take(&self.output)
    }

    fn close_input(&self) {
        self.close_input_calls.fetch_add(1, Ordering::SeqCst);
        self.input_closed.cancel();
    }

    fn output_is_terminal(&self) -> bool {
        true
    }

    fn error_is_terminal(&self) -> bool {
        true
    }

    fn size(&self) -> TerminalSize {
        TerminalSize::default()
    }

    fn make_raw(&self) -> Result<RawState> {
        Ok(RawState::none())
    }

    fn restore(&self, _state: RawState) -> Result<()> {
        Ok(())
    }

    fn enable_virtual_terminal(&self) {}

    fn on_resize(&self) -> ResizeEvents {
        ResizeEvents::closed()
    }

    fn close(&self) -> Result<()> {
        self.close_input();
        Ok(())
    }
}

/// Session whose child is simulated by in-memory pipes
pub(crate) struct MockSession {
    id: Uuid,
    stdin: Mutex<Option<DuplexStream>>,
    output: Mutex<Option<DuplexStream>>,
    pub close_stdin_calls: AtomicUsize,
}

/// Test-side ends of a [`MockSession`]
pub(crate) struct SessionEnds {
    /// Bytes written to the session arrive here
    pub stdin: DuplexStream,
    /// Bytes written here are read from the session
    pub output: DuplexStream,
}

pub(crate) fn mock_session() -> (MockSession, SessionEnds) {
    let (stdin, session_in) = tokio::io::duplex(PIPE_CAPACITY);
    let (output, session_out) = tokio::io::duplex(PIPE_CAPACITY);
    let session = MockSession {
        id: Uuid::new_v4(),
        stdin: Mutex::new(Some(session_in)),
        output: Mutex::new(Some(session_out)),
        close_stdin_calls: AtomicUsize::new(0),
    };
    (session, SessionEnds { stdin, output })
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream already taken")
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn pid(&self) -> u32 {
        0
    }

    fn reader(&self) -> io::Result<BoxedReader> {
        take(&self.output)
            .map(|s| Box::new(s) as BoxedReader)
            .ok_or_else(gone)
    }

    fn writer(&self) -> io::Result<BoxedWriter> {
        take(&self.stdin)
            .map(|s| Box::new(s) as BoxedWriter)
            .ok_or_else(gone)
    }

    fn resize(&self, _size: TerminalSize) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<TerminalSize> {
        Ok(TerminalSize::default())
    }

    async fn wait(&self) -> Result<()> {
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        Ok(())
    }

    fn close_stdin(&self) -> Result<()> {
        self.close_stdin_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

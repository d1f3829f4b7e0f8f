//! Console/session relay
//!
//! A [`Mux`] connects a [`Console`] to a [`Session`] with two independent copy
//! tasks: console input to session input, and session output to console
//! output. It runs once: `Init -> Running -> Stopped`.

use std::sync::{Arc, Mutex, Once};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::console::Console;
use crate::error::{Error, Result};
use crate::io::{relay, BoxedReader, BoxedWriter};
use crate::lifecycle::Lifecycle;
use crate::session::Session;

/// Sends "stdin closed" to the session for whichever direction finishes first
struct EofSignal {
    once: Once,
    session: Arc<dyn Session>,
}

impl EofSignal {
    fn fire(&self, direction: &'static str) {
        self.once.call_once(|| {
            debug!("{} relay finished first, closing session stdin", direction);
            if let Err(e) = self.session.close_stdin() {
                debug!("close_stdin failed: {}", e);
            }
        });
    }
}

/// Copy one direction until EOF, error or cancellation
async fn run_direction(
    direction: &'static str,
    reader: Option<BoxedReader>,
    writer: std::io::Result<BoxedWriter>,
    token: CancellationToken,
    eof: Arc<EofSignal>,
) {
    let (reader, writer) = match (reader, writer) {
        (Some(reader), Ok(writer)) => (reader, writer),
        (None, _) => {
            debug!("{} relay has no source", direction);
            eof.fire(direction);
            return;
        }
        (_, Err(e)) => {
            debug!("{} relay has no sink: {}", direction, e);
            eof.fire(direction);
            return;
        }
    };

    tokio::select! {
        _ = token.cancelled() => {
            debug!("{} relay stopped", direction);
            return;
        }
        result = relay(reader, writer) => match result {
            Ok(bytes) => debug!("{} relay reached EOF after {} bytes", direction, bytes),
            Err(e) => debug!("{} relay ended: {}", direction, e),
        },
    }
    eof.fire(direction);
}

/// Bidirectional relay between a console and a session
pub struct Mux {
    lifecycle: Lifecycle,
    token: CancellationToken,
    tracker: TaskTracker,
    console: Mutex<Option<Arc<dyn Console>>>,
    /// Fires when the output direction has finished on its own
    output_done: CancellationToken,
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

impl Mux {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            console: Mutex::new(None),
            output_done: CancellationToken::new(),
        }
    }

    /// Start relaying. Fails with [`Error::MuxAlreadyStarted`] unless this is
    /// the first call and [`stop`](Mux::stop) has not run.
    pub fn start(&self, console: Arc<dyn Console>, session: Arc<dyn Session>) -> Result<()> {
        if !self.lifecycle.start() {
            return Err(Error::MuxAlreadyStarted);
        }
        info!("mux started for session {}", session.id());

        let input = console.input();
        let output = console.output();
        *self.console.lock().unwrap_or_else(|e| e.into_inner()) = Some(console);

        let eof = Arc::new(EofSignal {
            once: Once::new(),
            session: session.clone(),
        });

        self.tracker.spawn(run_direction(
            "input",
            input,
            session.writer(),
            self.token.clone(),
            eof.clone(),
        ));
        let output_done = self.output_done.clone();
        let output_relay = run_direction(
            "output",
            session.reader().ok(),
            output.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "console output taken")
            }),
            self.token.clone(),
            eof,
        );
        self.tracker.spawn(async move {
            output_relay.await;
            output_done.cancel();
        });
        Ok(())
    }

    /// Resolves once the session's output has been fully relayed to the
    /// console, or relaying has stopped
    pub async fn output_finished(&self) {
        self.output_done.cancelled().await;
    }

    /// Stop relaying and wait for both directions to finish
    ///
    /// Only the first call tears down (cancels the relays and closes console
    /// input). Every call waits for the relay tasks to exit.
    pub async fn stop(&self) {
        if self.lifecycle.stop() {
            self.token.cancel();
            let console = self
                .console
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(console) = console {
                console.close_input();
            }
            info!("mux stopped");
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_console, mock_session};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_relays_input_exactly() {
        let (console, mut console_ends) = mock_console();
        let (session, mut session_ends) = mock_session();
        let session = Arc::new(session);
        let mux = Mux::new();
        mux.start(Arc::new(console), session.clone()).unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            console_ends.keys.write_all(&payload).await.unwrap();
            // Dropping the keyboard ends the input direction.
        });

        let mut received = Vec::new();
        timeout(
            Duration::from_secs(5),
            session_ends.stdin.read_to_end(&mut received),
        )
        .await
        .unwrap()
        .unwrap();
        writer.await.unwrap();

        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);
        assert_eq!(session.close_stdin_calls.load(Ordering::SeqCst), 1);

        drop(session_ends.output);
        timeout(Duration::from_secs(5), mux.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_relays_output_to_console() {
        let (console, mut console_ends) = mock_console();
        let (session, mut session_ends) = mock_session();
        let mux = Mux::new();
        mux.start(Arc::new(console), Arc::new(session)).unwrap();

        session_ends.output.write_all(b"hello from child").await.unwrap();
        let mut buf = [0u8; 16];
        timeout(Duration::from_secs(5), console_ends.screen.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello from child");

        drop(session_ends.output);
        timeout(Duration::from_secs(5), mux.output_finished())
            .await
            .unwrap();
        timeout(Duration::from_secs(5), mux.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (console, mut console_ends) = mock_console();
        let (session, mut session_ends) = mock_session();
        let console: Arc<dyn Console> = Arc::new(console);
        let session: Arc<dyn Session> = Arc::new(session);
        let mux = Mux::new();

        mux.start(console.clone(), session.clone()).unwrap();
        let err = mux.start(console, session).unwrap_err();
        assert!(matches!(err, Error::MuxAlreadyStarted));

        console_ends.keys.write_all(b"abc").await.unwrap();
        drop(console_ends.keys);

        let mut received = Vec::new();
        timeout(
            Duration::from_secs(5),
            session_ends.stdin.read_to_end(&mut received),
        )
        .await
        .unwrap()
        .unwrap();
        // A single pass, not doubled.
        assert_eq!(received, b"abc");

        timeout(Duration::from_secs(5), mux.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let (console, mut console_ends) = mock_console();
        let (session, mut session_ends) = mock_session();
        let console = Arc::new(console);
        let session = Arc::new(session);
        let mux = Mux::new();
        mux.start(console.clone(), session.clone()).unwrap();

        console_ends.keys.write_all(b"before").await.unwrap();
        let mut buf = [0u8; 6];
        timeout(Duration::from_secs(5), session_ends.stdin.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"before");

        timeout(Duration::from_secs(5), mux.stop()).await.unwrap();
        timeout(Duration::from_secs(5), mux.stop()).await.unwrap();
        assert_eq!(console.close_input_calls.load(Ordering::SeqCst), 1);

        // Both relay tasks have exited, so nothing written now can arrive.
        let _ = console_ends.keys.write_all(b"after").await;
        let mut rest = Vec::new();
        timeout(
            Duration::from_secs(5),
            session_ends.stdin.read_to_end(&mut rest),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(rest.is_empty());

        // Stopping is not end-of-stream.
        assert_eq!(session.close_stdin_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_stdin_signalled_once() {
        let (console, mut console_ends) = mock_console();
        let (session, mut session_ends) = mock_session();
        let session = Arc::new(session);
        let mux = Mux::new();
        mux.start(Arc::new(console), session.clone()).unwrap();

        drop(console_ends.keys);
        drop(session_ends.output);

        // Both directions have finished once their sinks report EOF.
        let mut sink = Vec::new();
        timeout(Duration::from_secs(5), session_ends.stdin.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), console_ends.screen.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();

        timeout(Duration::from_secs(5), mux.stop()).await.unwrap();
        assert_eq!(session.close_stdin_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (console, _console_ends) = mock_console();
        let (session, _session_ends) = mock_session();
        let mux = Mux::new();

        timeout(Duration::from_secs(1), mux.stop()).await.unwrap();
        let err = mux.start(Arc::new(console), Arc::new(session)).unwrap_err();
        assert!(matches!(err, Error::MuxAlreadyStarted));
    }
}

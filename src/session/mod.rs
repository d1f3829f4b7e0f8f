//! Process sessions
//!
//! A [`Session`] is one child process attached to the peripheral side of a
//! pseudo-terminal, together with the controller-side streams used to talk to
//! it. Sessions are created with [`spawn`] and are exclusively owned: the
//! process, the pty pair and (on Windows) the job object are released exactly
//! once by [`Session::close`].

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::PtySession;
#[cfg(windows)]
pub use windows::PtySession;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, ExitError, Result};
use crate::io::{BoxedReader, BoxedWriter};
use crate::pty::TerminalSize;

/// Final outcome of a process as published by its exit watcher
pub(crate) type Outcome = std::result::Result<(), ExitError>;

/// Options for launching a process on a fresh pseudo-terminal
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Program to run, resolved through `PATH`
    pub program: String,
    /// Arguments, not including the program itself
    pub args: Vec<String>,
    /// Complete environment for the child. `None` inherits ours.
    pub env: Option<HashMap<String, String>>,
    /// Working directory. `None` inherits ours.
    pub dir: Option<PathBuf>,
    /// Initial terminal geometry
    pub size: TerminalSize,
}

impl SpawnOptions {
    /// Create spawn options with no arguments and the default terminal size
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: None,
            dir: None,
            size: TerminalSize::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the child's environment entirely
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }
}

/// A running (or finished) process attached to a pseudo-terminal
///
/// Every method may be called concurrently with [`wait`](Session::wait);
/// none of them block on process exit.
#[async_trait]
pub trait Session: Send + Sync {
    /// Unique identifier of this session
    fn id(&self) -> Uuid;

    /// OS process id of the child
    fn pid(&self) -> u32;

    /// A new read handle on the child's output. Reports EOF once the session is closed.
    fn reader(&self) -> io::Result<BoxedReader>;

    /// A new write handle on the child's input. Fails with `BrokenPipe` once
    /// stdin or the whole session is closed.
    fn writer(&self) -> io::Result<BoxedWriter>;

    /// Set the terminal geometry. No-op once the session is closed.
    fn resize(&self, size: TerminalSize) -> Result<()>;

    /// Current terminal geometry
    fn size(&self) -> Result<TerminalSize>;

    /// Wait for the process to terminate
    ///
    /// Returns `Ok(())` for a clean zero exit and [`Error::Exit`] otherwise.
    /// May be awaited by any number of callers.
    async fn wait(&self) -> Result<()>;

    /// Terminate the process. Idempotent.
    fn kill(&self) -> Result<()>;

    /// Signal end-of-input to the child without terminating it. Idempotent.
    fn close_stdin(&self) -> Result<()>;

    /// Release the process and pty resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Allocate a pseudo-terminal and launch `options.program` on it
///
/// Cancelling `token` terminates the process. Must be called from within a
/// tokio runtime, since the exit watcher runs as a background task.
pub fn spawn(token: &CancellationToken, options: SpawnOptions) -> Result<PtySession> {
    if options.program.is_empty() {
        return Err(Error::EmptyProgram);
    }
    PtySession::spawn(token, options)
}

/// Wait until the exit watcher publishes an outcome
pub(crate) async fn wait_for_exit(exit: &watch::Receiver<Option<Outcome>>) -> Result<()> {
    let mut exit = exit.clone();
    let outcome = match exit.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "exit watcher ended without a status",
            )))
        }
    };
    match outcome {
        Some(Ok(())) | None => Ok(()),
        Some(Err(exit)) => Err(Error::Exit(exit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_options_builder() {
        let options = SpawnOptions::new("sh")
            .with_args(["-c", "true"])
            .with_dir("/tmp")
            .with_size(TerminalSize::new(132, 43));

        assert_eq!(options.program, "sh");
        assert_eq!(options.args, vec!["-c".to_string(), "true".to_string()]);
        assert_eq!(options.dir, Some(PathBuf::from("/tmp")));
        assert_eq!(options.size, TerminalSize::new(132, 43));
        assert!(options.env.is_none());
    }

    #[tokio::test]
    async fn test_empty_program_is_rejected() {
        let token = CancellationToken::new();
        let err = spawn(&token, SpawnOptions::new("")).unwrap_err();
        assert!(matches!(err, Error::EmptyProgram));
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_published_status() {
        let (tx, rx) = watch::channel(None);
        tx.send(Some(Err(ExitError::new(
            7,
            crate::error::RawStatus::Exited(7),
        ))))
        .unwrap();
        drop(tx);

        let err = wait_for_exit(&rx).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(7));
        // Repeated waits see the same status.
        assert_eq!(wait_for_exit(&rx).await.unwrap_err().exit_code(), Some(7));
    }
}

//! Orchestration
//!
//! [`run`] launches a program on a pty and waits for it. [`run_interactive`]
//! additionally wires it to the host console through a [`Mux`], forwarding
//! resizes and keeping the console in raw mode for the session's lifetime.
//! Without a console it falls back to plain stream copying.
//!
//! Every task started here is joined before the call returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::console::{self, Console, RawState, SystemConsole};
use crate::error::{Error, Result};
use crate::io::relay;
use crate::mux::Mux;
use crate::pty::TerminalSize;
use crate::session::{spawn, Session, SpawnOptions};

/// How long buffered child output may take to drain after the child exits
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Wait for the session to exit, or kill it when `token` fires
///
/// On cancellation the session is closed and its exit watcher is still
/// awaited, so the process has been reaped by the time this returns.
async fn wait_or_cancel(token: &CancellationToken, session: &dyn Session) -> Result<()> {
    let mut waiter = session.wait();
    tokio::select! {
        result = &mut waiter => return result,
        _ = token.cancelled() => {}
    }

    info!("cancelled, terminating pid {}", session.pid());
    if let Err(e) = session.close() {
        debug!("close after cancellation failed: {}", e);
    }
    let _ = waiter.await;
    Err(Error::Cancelled)
}

/// A kill we performed ourselves is not a failure of the child
fn forgive_kill(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::Exit(exit)) if exit.is_killed() => {
            debug!("session was torn down deliberately: {}", exit);
            Ok(())
        }
        other => other,
    }
}

/// Run a program on a pty and wait for it, discarding its output
///
/// Returns [`Error::Cancelled`] if `token` fires first; the process is
/// terminated and reaped before that error is returned.
pub async fn run(token: &CancellationToken, options: SpawnOptions) -> Result<()> {
    let token = token.child_token();
    let session = spawn(&token, options)?;

    // Keep the pty drained so a chatty child cannot block on a full buffer.
    let drain = match session.reader() {
        Ok(reader) => Some(tokio::spawn(async move {
            relay(reader, tokio::io::sink()).await
        })),
        Err(e) => {
            debug!("no output drain: {}", e);
            None
        }
    };

    let result = wait_or_cancel(&token, &session).await;
    if let Err(e) = session.close() {
        debug!("close failed: {}", e);
    }
    if let Some(drain) = drain {
        let _ = drain.await;
    }
    result
}

/// Run a program on a pty, copying `input` to it and its output to `output`
///
/// End of `input` is forwarded as end-of-input to the child. An exit caused
/// by our own kill is reported as success.
pub async fn run_passthrough<R, W>(
    token: &CancellationToken,
    options: SpawnOptions,
    input: R,
    output: W,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let token = token.child_token();
    let session = Arc::new(spawn(&token, options)?);

    let input_task: JoinHandle<()> = {
        let session = session.clone();
        let writer = session.writer()?;
        tokio::spawn(async move {
            match relay(input, writer).await {
                Ok(bytes) => debug!("input reached EOF after {} bytes", bytes),
                Err(e) => debug!("input relay ended: {}", e),
            }
            if let Err(e) = session.close_stdin() {
                debug!("close_stdin failed: {}", e);
            }
        })
    };
    let mut output_task: JoinHandle<()> = {
        let reader = session.reader()?;
        tokio::spawn(async move {
            match relay(reader, output).await {
                Ok(bytes) => debug!("output reached EOF after {} bytes", bytes),
                Err(e) => debug!("output relay ended: {}", e),
            }
        })
    };

    let result = forgive_kill(wait_or_cancel(&token, session.as_ref()).await);

    let drained = timeout(DRAIN_GRACE, &mut output_task).await.is_ok();
    if !drained {
        debug!("output still open {:?} after exit, closing", DRAIN_GRACE);
    }
    if let Err(e) = session.close() {
        debug!("close failed: {}", e);
    }
    input_task.abort();
    let _ = input_task.await;
    if !drained {
        let _ = output_task.await;
    }
    result
}

/// Run a program on a pty attached to the host console
///
/// Falls back to [`run_passthrough`] over stdin/stdout when stdout is not a
/// terminal.
pub async fn run_interactive(token: &CancellationToken, options: SpawnOptions) -> Result<()> {
    let console = match SystemConsole::open() {
        Ok(console) => console,
        Err(e) if e.is_not_a_console() => {
            debug!("no console attached, using passthrough");
            let input_closed = CancellationToken::new();
            let (input, input_thread) = console::stdin_reader(input_closed.clone());
            let result = run_passthrough(token, options, input, tokio::io::stdout()).await;
            input_closed.cancel();
            input_thread.join().await;
            return result;
        }
        Err(e) => return Err(e),
    };
    let input_thread = console.take_input_thread();
    let result = run_with_console(token, options, Arc::new(console)).await;
    if let Some(input_thread) = input_thread {
        input_thread.join().await;
    }
    result
}

/// Forward resize notifications to the session until `stop` fires
async fn forward_resizes(
    console: Arc<dyn Console>,
    session: Arc<dyn Session>,
    stop: CancellationToken,
) {
    let mut events = console.on_resize();
    let mut last: Option<TerminalSize> = session.size().ok();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => {
                if event.is_none() {
                    break;
                }
                let size = console.size();
                if !size.is_valid() || last == Some(size) {
                    continue;
                }
                match session.resize(size) {
                    Ok(()) => {
                        debug!("resized session to {}x{}", size.cols, size.rows);
                        last = Some(size);
                    }
                    Err(e) => warn!("failed to resize session: {}", e),
                }
            }
        }
    }
}

fn release_console(console: &dyn Console, raw: RawState) {
    if let Err(e) = console.restore(raw) {
        warn!("failed to restore console mode: {}", e);
    }
    if let Err(e) = console.close() {
        debug!("console close failed: {}", e);
    }
}

/// Interactive run against an already opened console
pub(crate) async fn run_with_console(
    token: &CancellationToken,
    options: SpawnOptions,
    console: Arc<dyn Console>,
) -> Result<()> {
    console.enable_virtual_terminal();
    let raw = match console.make_raw() {
        Ok(raw) => raw,
        Err(e) => {
            warn!("failed to switch console to raw mode: {}", e);
            RawState::none()
        }
    };

    let size = console.size();
    let options = if size.is_valid() {
        options.with_size(size)
    } else {
        options
    };

    let token = token.child_token();
    let session: Arc<dyn Session> = match spawn(&token, options) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            release_console(console.as_ref(), raw);
            return Err(e);
        }
    };

    let mux = Mux::new();
    let started = mux.start(console.clone(), session.clone());

    let resize_stop = CancellationToken::new();
    let resizer = tokio::spawn(forward_resizes(
        console.clone(),
        session.clone(),
        resize_stop.clone(),
    ));

    let result = match started {
        Ok(()) => {
            let result = wait_or_cancel(&token, session.as_ref()).await;
            if !matches!(result, Err(Error::Cancelled))
                && timeout(DRAIN_GRACE, mux.output_finished()).await.is_err()
            {
                debug!("output still open {:?} after exit", DRAIN_GRACE);
            }
            result
        }
        Err(e) => Err(e),
    };

    mux.stop().await;
    resize_stop.cancel();
    let _ = resizer.await;
    release_console(console.as_ref(), raw);
    if let Err(e) = session.close() {
        debug!("close failed: {}", e);
    }
    result
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::mock_console;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> SpawnOptions {
        SpawnOptions::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_run_clean_exit() {
        let token = CancellationToken::new();
        timeout(Duration::from_secs(10), run(&token, sh("echo done")))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let token = CancellationToken::new();
        let err = timeout(Duration::from_secs(10), run(&token, sh("exit 3")))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_run_cancellation_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!(
            "echo $$ > {}; for i in 1 2 3; do sleep 5; done",
            pidfile.display()
        );

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            let pidfile = pidfile.clone();
            tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
                while tokio::time::Instant::now() < deadline {
                    if std::fs::read_to_string(&pidfile)
                        .map(|s| !s.trim().is_empty())
                        .unwrap_or(false)
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
                token.cancel();
            })
        };

        let err = timeout(Duration::from_secs(10), run(&token, sh(&script)))
            .await
            .expect("run should return promptly after cancellation")
            .unwrap_err();
        assert!(err.is_cancelled());
        canceller.await.unwrap();

        let pid: libc::pid_t = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // SAFETY: signal 0 only probes for existence.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "process {pid} outlived cancellation");
    }

    #[tokio::test]
    async fn test_passthrough_relays_output() {
        let token = CancellationToken::new();
        let (output, mut screen) = tokio::io::duplex(64 * 1024);

        timeout(
            Duration::from_secs(10),
            run_passthrough(&token, sh("echo hello"), tokio::io::empty(), output),
        )
        .await
        .unwrap()
        .unwrap();

        let mut captured = Vec::new();
        screen.read_to_end(&mut captured).await.unwrap();
        assert!(String::from_utf8_lossy(&captured).contains("hello"));
    }

    #[tokio::test]
    async fn test_passthrough_forwards_input_eof() {
        let token = CancellationToken::new();
        let (output, mut screen) = tokio::io::duplex(64 * 1024);
        let input = std::io::Cursor::new(b"ping\n".to_vec());

        timeout(
            Duration::from_secs(10),
            run_passthrough(&token, SpawnOptions::new("cat"), input, output),
        )
        .await
        .expect("cat should exit once input ends")
        .unwrap();

        let mut captured = Vec::new();
        screen.read_to_end(&mut captured).await.unwrap();
        assert!(String::from_utf8_lossy(&captured).contains("ping"));
    }

    #[tokio::test]
    async fn test_passthrough_input_without_trailing_newline() {
        let token = CancellationToken::new();
        let (output, mut screen) = tokio::io::duplex(64 * 1024);
        let input = std::io::Cursor::new(b"ping".to_vec());

        timeout(
            Duration::from_secs(10),
            run_passthrough(&token, SpawnOptions::new("cat"), input, output),
        )
        .await
        .expect("cat should exit once an unterminated input ends")
        .unwrap();

        let mut captured = Vec::new();
        screen.read_to_end(&mut captured).await.unwrap();
        assert!(String::from_utf8_lossy(&captured).contains("ping"));
    }

    #[tokio::test]
    async fn test_passthrough_cancellation() {
        let token = CancellationToken::new();
        let (output, _screen) = tokio::io::duplex(64 * 1024);
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                token.cancel();
            })
        };

        let err = timeout(
            Duration::from_secs(10),
            run_passthrough(
                &token,
                SpawnOptions::new("sleep").with_args(["30"]),
                tokio::io::empty(),
                output,
            ),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_cancelled());
        canceller.await.unwrap();
    }

    #[test]
    fn test_forgive_kill() {
        use crate::error::{ExitError, RawStatus, KILLED_EXIT_CODE};

        let killed = Err(Error::Exit(ExitError::new(
            KILLED_EXIT_CODE,
            RawStatus::Signaled {
                signal: libc::SIGKILL,
                core_dumped: false,
            },
        )));
        assert!(forgive_kill(killed).is_ok());

        let failed = Err(Error::Exit(ExitError::new(2, RawStatus::Exited(2))));
        assert_eq!(forgive_kill(failed).unwrap_err().exit_code(), Some(2));
        assert!(forgive_kill(Err(Error::Cancelled)).unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_interactive_with_console() {
        let token = CancellationToken::new();
        let (console, mut ends) = mock_console();
        let console = Arc::new(console);

        timeout(
            Duration::from_secs(10),
            run_with_console(&token, sh("echo interactive"), console.clone()),
        )
        .await
        .unwrap()
        .unwrap();

        let mut captured = Vec::new();
        timeout(Duration::from_secs(5), ends.screen.read_to_end(&mut captured))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&captured).contains("interactive"));
        assert_eq!(
            console
                .close_input_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            // Once from the mux, once from closing the console.
            2
        );
    }
}

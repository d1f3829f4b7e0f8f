//! Windows sessions
//!
//! The child is created suspended with an extended startup-info block that
//! attaches it to the pseudo console, placed in a job object that kills every
//! member when the job handle closes, and then resumed. Two watchers run per
//! session: one waits for the natural exit and releases the pseudo console,
//! the other handles kill and cancellation.

use std::collections::HashMap;
use std::ffi::{c_void, OsStr};
use std::fmt;
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows_sys::Win32::Foundation::{HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, ResumeThread, TerminateProcess, WaitForSingleObject,
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};

use super::{wait_for_exit, Outcome, Session, SpawnOptions};
use crate::error::{Error, ExitError, RawStatus, Result, KILLED_EXIT_CODE};
use crate::io::{BoxedReader, BoxedWriter, Guarded};
use crate::lifecycle::Lifecycle;
use crate::pty::{self, PtyPair, TerminalSize};

/// How long a terminated process may take to go away before the pseudo
/// console is force-closed
const KILL_GRACE: Duration = Duration::from_millis(1500);

fn raw(handle: &OwnedHandle) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}

/// Take ownership of a handle returned by a Win32 call, `0` meaning failure
fn owned(handle: HANDLE) -> io::Result<OwnedHandle> {
    if handle == 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: a non-null handle just returned to us and not yet owned elsewhere.
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0)).collect()
}

/// Append `arg` to `line` quoted per the MSVC argv rules
fn quote_arg(arg: &str, line: &mut String) {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\x0b', '"']) {
        line.push_str(arg);
        return;
    }

    line.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                line.extend(iter::repeat('\\').take(backslashes * 2 + 1));
                line.push('"');
                backslashes = 0;
            }
            _ => {
                line.extend(iter::repeat('\\').take(backslashes));
                line.push(c);
                backslashes = 0;
            }
        }
    }
    // Trailing backslashes precede the closing quote and must be doubled.
    line.extend(iter::repeat('\\').take(backslashes * 2));
    line.push('"');
}

/// Build the command line passed to `CreateProcessW`
pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    let mut line = String::new();
    quote_arg(program, &mut line);
    for arg in args {
        line.push(' ');
        quote_arg(arg, &mut line);
    }
    line
}

/// Build a `CREATE_UNICODE_ENVIRONMENT` block
///
/// Entries whose key or value contains NUL cannot be represented and are
/// skipped, as are empty keys. Keys are sorted case-insensitively.
pub(crate) fn environment_block(env: &HashMap<String, String>) -> Vec<u16> {
    let mut entries: Vec<(&String, &String)> = env
        .iter()
        .filter(|(key, value)| {
            let valid = !key.is_empty() && !key.contains('\0') && !value.contains('\0');
            if !valid {
                debug!("skipping unrepresentable environment entry {:?}", key);
            }
            valid
        })
        .collect();
    entries.sort_by_key(|(key, _)| key.to_uppercase());

    let mut block = Vec::new();
    for (key, value) in entries {
        block.extend(OsStr::new(&format!("{key}={value}")).encode_wide());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

fn create_job() -> io::Result<OwnedHandle> {
    // SAFETY: anonymous job with default security.
    let job = owned(unsafe { CreateJobObjectW(ptr::null(), ptr::null()) })?;

    // SAFETY: plain-data struct, all-zero is a valid initial value.
    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
    info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    // SAFETY: info is a valid struct of the size passed.
    let ok = unsafe {
        SetInformationJobObject(
            raw(&job),
            JobObjectExtendedLimitInformation,
            &info as *const _ as *const c_void,
            mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(job)
}

/// Map a Win32 exit code to the session outcome
fn outcome(code: u32, killed: bool) -> Outcome {
    if killed {
        return Err(ExitError::new(KILLED_EXIT_CODE, RawStatus::Win32(code)));
    }
    match code {
        0 => Ok(()),
        code => Err(ExitError::new(code as i32, RawStatus::Win32(code))),
    }
}

/// A child process attached to a Windows pseudo console
pub struct PtySession {
    id: Uuid,
    pid: u32,
    program: String,
    pair: Arc<PtyPair>,
    /// Dropping the job kills the whole process tree
    job: Arc<Mutex<Option<OwnedHandle>>>,
    thread: Mutex<Option<OwnedHandle>>,
    closed: CancellationToken,
    stdin_closed: CancellationToken,
    kill: CancellationToken,
    lifecycle: Lifecycle,
    stdin: Lifecycle,
    exit: watch::Receiver<Option<Outcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PtySession {
    pub(crate) fn spawn(token: &CancellationToken, options: SpawnOptions) -> Result<Self> {
        let size = options.size.or_default();
        let mut pair = pty::allocate(size)?;
        let spawn_err = |e: io::Error| Error::spawn(&options.program, e);

        let mut line = wide(OsStr::new(&command_line(&options.program, &options.args)));
        let env = options.env.as_ref().map(environment_block);
        let dir = options.dir.as_ref().map(|dir| wide(dir.as_os_str()));

        let job = create_job().map_err(spawn_err)?;

        // SAFETY: plain-data struct, all-zero is a valid initial value.
        let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        // Keep our own standard handles away from the child; the pseudo console supplies its own.
        startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup.StartupInfo.hStdInput = INVALID_HANDLE_VALUE;
        startup.StartupInfo.hStdOutput = INVALID_HANDLE_VALUE;
        startup.StartupInfo.hStdError = INVALID_HANDLE_VALUE;
        startup.lpAttributeList = pair.attribute_list().ok_or_else(|| {
            Error::allocation(
                "attribute list",
                io::Error::new(io::ErrorKind::NotConnected, "attribute list already released"),
            )
        })?;

        // SAFETY: plain-data struct filled in by CreateProcessW.
        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        // SAFETY: every pointer refers to a live, NUL-terminated buffer or is null.
        let ok = unsafe {
            CreateProcessW(
                ptr::null(),
                line.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                0,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT | CREATE_SUSPENDED,
                env.as_ref()
                    .map_or(ptr::null(), |block| block.as_ptr() as *const c_void),
                dir.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
                &startup.StartupInfo,
                &mut info,
            )
        };
        if ok == 0 {
            return Err(spawn_err(io::Error::last_os_error()));
        }
        let process = owned(info.hProcess).map_err(spawn_err)?;
        let thread = owned(info.hThread).map_err(spawn_err)?;
        pair.release_attributes();

        // Assigned while suspended so no grandchild can escape the job.
        // SAFETY: both handles are live.
        if unsafe { AssignProcessToJobObject(raw(&job), raw(&process)) } == 0 {
            let err = io::Error::last_os_error();
            // SAFETY: live process handle.
            unsafe { TerminateProcess(raw(&process), 1) };
            return Err(spawn_err(err));
        }
        // SAFETY: live thread handle of the suspended primary thread.
        if unsafe { ResumeThread(raw(&thread)) } == u32::MAX {
            let err = io::Error::last_os_error();
            // SAFETY: live process handle.
            unsafe { TerminateProcess(raw(&process), 1) };
            return Err(spawn_err(err));
        }

        let pid = info.dwProcessId;
        info!("spawned '{}' (pid {})", options.program, pid);

        let pair = Arc::new(pair);
        let process = Arc::new(process);
        let job = Arc::new(Mutex::new(Some(job)));
        let killed = Arc::new(AtomicBool::new(false));
        let kill = token.child_token();
        let exited = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        // Natural exit: publish the status and release the pseudo console.
        {
            let process = process.clone();
            let pair = pair.clone();
            let killed = killed.clone();
            let exited = exited.clone();
            tokio::task::spawn_blocking(move || {
                // SAFETY: the process handle is kept alive by the Arc.
                unsafe { WaitForSingleObject(raw(&process), INFINITE) };
                let mut code = 0u32;
                // SAFETY: live handle and a valid out-pointer.
                let outcome = if unsafe { GetExitCodeProcess(raw(&process), &mut code) } == 0 {
                    warn!(
                        "failed to read exit code of pid {}: {}",
                        pid,
                        io::Error::last_os_error()
                    );
                    outcome(code, true)
                } else {
                    outcome(code, killed.load(Ordering::SeqCst))
                };
                debug!("pid {} exited with {:?}", pid, outcome);
                pair.close_console();
                let _ = exit_tx.send(Some(outcome));
                exited.cancel();
            });
        }

        // Kill and cancellation: close the job, terminate, and force the pseudo
        // console closed if the process lingers past the grace period.
        {
            let process = process.clone();
            let pair = pair.clone();
            let job = job.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = exited.cancelled() => return,
                    _ = kill.cancelled() => {}
                }
                debug!("terminating pid {}", pid);
                killed.store(true, Ordering::SeqCst);
                lock(&job).take();
                // SAFETY: the process handle is kept alive by the Arc.
                unsafe { TerminateProcess(raw(&process), 1) };

                let grace = KILL_GRACE.as_millis() as u32;
                let waited = tokio::task::spawn_blocking(move || {
                    // SAFETY: as above.
                    unsafe { WaitForSingleObject(raw(&process), grace) }
                })
                .await;
                match waited {
                    Ok(WAIT_OBJECT_0) => {}
                    Ok(WAIT_TIMEOUT) => {
                        warn!("pid {} still running after terminate, closing pseudo console", pid);
                        pair.close_console();
                    }
                    Ok(status) => debug!("unexpected wait status {} for pid {}", status, pid),
                    Err(e) => debug!("grace wait for pid {} failed: {}", pid, e),
                }
            });
        }

        let closed = CancellationToken::new();
        let stdin_closed = closed.child_token();

        Ok(Self {
            id: Uuid::new_v4(),
            pid,
            program: options.program,
            pair,
            job,
            thread: Mutex::new(Some(thread)),
            closed,
            stdin_closed,
            kill,
            lifecycle: Lifecycle::running(),
            stdin: Lifecycle::running(),
            exit: exit_rx,
        })
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
        let output = tokio::fs::File::from_std(self.pair.clone_output()?);
        Ok(Box::new(Guarded::new(output, &self.closed)))
    }

    fn writer(&self) -> io::Result<BoxedWriter> {
        let input = tokio::fs::File::from_std(self.pair.clone_input()?);
        Ok(Box::new(Guarded::new(input, &self.stdin_closed)))
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        self.pair.resize(size)
    }

    fn size(&self) -> Result<TerminalSize> {
        self.pair.size()
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

    fn close_stdin(&self) -> Result<()> {
        if !self.stdin.stop() {
            return Ok(());
        }
        self.stdin_closed.cancel();
        self.pair.close_input();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }
        debug!("closing session {} (pid {})", self.id, self.pid);
        self.kill.cancel();
        self.closed.cancel();
        lock(&self.job).take();
        self.pair.close();
        lock(&self.thread).take();
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

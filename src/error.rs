//! Error types
//!
//! One taxonomy shared by every layer: allocation and spawn failures propagate
//! to the caller, relay failures never reach this type.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Exit code reported when the process was terminated by us (kill or cancellation)
pub const KILLED_EXIT_CODE: i32 = -1;

/// Errors that can occur while allocating, spawning, relaying or waiting
#[derive(Debug, Error)]
pub enum Error {
    /// The standard stream is not backed by a terminal device
    #[error("ptyx: not a console")]
    NotAConsole,

    #[error("ptyx: empty program")]
    EmptyProgram,

    #[error("failed to allocate pty ({op}): {source}")]
    Allocation {
        /// The OS primitive that failed
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exit(#[from] ExitError),

    #[error("ptyx: mux already started")]
    MuxAlreadyStarted,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for ptyx operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn allocation(op: &'static str, source: io::Error) -> Self {
        Error::Allocation { op, source }
    }

    pub(crate) fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Error::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Whether this is the "not a console" condition callers branch on
    pub fn is_not_a_console(&self) -> bool {
        matches!(self, Error::NotAConsole)
    }

    /// Whether this error came from a fired cancellation token
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Exit code carried by an [`ExitError`], if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Exit(exit) => Some(exit.code),
            _ => None,
        }
    }
}

/// Raw OS wait status behind an [`ExitError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    /// Normal exit with the given status
    Exited(i32),
    /// Terminated by a signal (POSIX)
    Signaled { signal: i32, core_dumped: bool },
    /// Process exit code as reported by `GetExitCodeProcess` (Windows)
    Win32(u32),
}

/// A process that finished with something other than a clean zero exit
///
/// `code` is [`KILLED_EXIT_CODE`] when the process was torn down by a signal,
/// an explicit kill or a cancellation rather than exiting on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitError {
    pub code: i32,
    pub status: RawStatus,
}

impl ExitError {
    pub fn new(code: i32, status: RawStatus) -> Self {
        Self { code, status }
    }

    /// Whether the exit denotes a deliberate kill rather than a normal exit path
    pub fn is_killed(&self) -> bool {
        self.code == KILLED_EXIT_CODE
    }

    /// The raw wait status (signal information on POSIX, status code on Windows)
    pub fn sys(&self) -> RawStatus {
        self.status
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process exited with status {}", self.code)
    }
}

impl std::error::Error for ExitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_error_display() {
        let err = ExitError::new(42, RawStatus::Exited(42));
        assert_eq!(err.to_string(), "process exited with status 42");
        assert!(!err.is_killed());
    }

    #[test]
    fn test_killed_exit_error() {
        let err = ExitError::new(
            KILLED_EXIT_CODE,
            RawStatus::Signaled {
                signal: 9,
                core_dumped: false,
            },
        );
        assert!(err.is_killed());
        assert_eq!(
            err.sys(),
            RawStatus::Signaled {
                signal: 9,
                core_dumped: false
            }
        );
    }

    #[test]
    fn test_not_a_console_is_distinguished() {
        assert!(Error::NotAConsole.is_not_a_console());
        assert!(!Error::EmptyProgram.is_not_a_console());
        assert!(!Error::Cancelled.is_not_a_console());
    }

    #[test]
    fn test_exit_code_accessor() {
        let err: Error = ExitError::new(3, RawStatus::Exited(3)).into();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.to_string(), "process exited with status 3");
        assert_eq!(Error::Cancelled.exit_code(), None);
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn test_allocation_error_names_primitive() {
        let err = Error::allocation("ioctl(TIOCGPTN)", io::Error::from_raw_os_error(25));
        assert!(err.to_string().contains("ioctl(TIOCGPTN)"));
    }
}

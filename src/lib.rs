//! ptyx
//!
//! Cross-platform pseudo-terminal sessions: allocate a pty (or a Windows
//! pseudo console), launch a program on it, relay it to the host console and
//! tear everything down deterministically.

pub mod config;
pub mod console;
pub mod error;
pub mod io;
pub mod lifecycle;
pub mod mux;
pub mod pty;
pub mod run;
pub mod session;

#[cfg(test)]
mod test_support;

pub use console::{open_console, Console, RawState, ResizeEvents, SystemConsole};
pub use error::{Error, ExitError, RawStatus, Result, KILLED_EXIT_CODE};
pub use mux::Mux;
pub use pty::{PtyBackend, PtyPair, TerminalSize};
pub use run::{run, run_interactive, run_passthrough};
pub use session::{spawn, PtySession, Session, SpawnOptions};

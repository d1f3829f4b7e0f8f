//! PTY allocation module
//!
//! Allocates a connected controller/peripheral pair and resizes it. Exactly
//! one backend is compiled in per target OS and exposed as [`NativeBackend`].

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::*;
#[cfg(windows)]
pub use windows::*;

use crate::error::Result;

/// Terminal geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Whether both dimensions are non-zero
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }

    /// Replace zero dimensions with the defaults
    pub fn or_default(self) -> Self {
        if self.is_valid() {
            self
        } else {
            Self::default()
        }
    }
}

/// Platform pseudo-terminal allocator
///
/// Implementations are self-contained: every fallback an implementation takes
/// happens inside `allocate` before an error is surfaced.
pub trait PtyBackend {
    /// Allocate a new pair with the given initial geometry
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair>;

    /// Set the geometry of an allocated pair. A closed pair is a no-op.
    fn resize(&self, pair: &PtyPair, size: TerminalSize) -> Result<()> {
        pair.resize(size)
    }
}

/// Allocate a pair with the backend selected for this build target
pub fn allocate(size: TerminalSize) -> Result<PtyPair> {
    NativeBackend::default().allocate(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_terminal_size_or_default() {
        assert_eq!(TerminalSize::new(0, 40).or_default(), TerminalSize::default());
        assert_eq!(
            TerminalSize::new(120, 40).or_default(),
            TerminalSize::new(120, 40)
        );
    }
}

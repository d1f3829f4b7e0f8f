//! POSIX pseudo-terminal backends
//!
//! Every variant opens a controller through the multiplexing device (or the
//! legacy `/dev/ptyXY` namespace), resolves and unlocks the peripheral, and
//! opens the peripheral with `O_NOCTTY`. The peripheral becomes the child's
//! controlling terminal later, at process launch.

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod darwin;
#[cfg(any(
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd"
))]
mod bsd;
mod legacy;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
mod stream;

#[cfg(any(
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd"
))]
pub use bsd::*;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use darwin::*;
pub use legacy::LegacyBackend;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxBackend;
pub use stream::PtyStream;

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::pty::TerminalSize;

/// Backend used on this target
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type NativeBackend = LinuxBackend;

/// Backend used on this target
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub type NativeBackend = DarwinBackend;

/// Backend used on this target
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
pub type NativeBackend = FreeBsdBackend;

/// Backend used on this target
#[cfg(target_os = "netbsd")]
pub type NativeBackend = NetBsdBackend;

/// Backend used on this target
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd"
)))]
pub type NativeBackend = LegacyBackend;

/// Path of the multiplexing device
pub(crate) const PTMX: &str = "/dev/ptmx";

/// Issue an ioctl on a borrowed descriptor, mapping `-1` to the OS error.
///
/// The request is cast to whatever integer type the platform's `ioctl`
/// declares (`c_ulong` on glibc and the BSDs, `c_int` on musl).
macro_rules! ioctl {
    ($fd:expr, $request:expr, $arg:expr) => {{
        // SAFETY: the descriptor is borrowed for the duration of the call and
        // the argument matches the request's documented type.
        let rc = unsafe { libc::ioctl(::std::os::fd::AsRawFd::as_raw_fd(&$fd), $request as _, $arg) };
        if rc == -1 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }};
}
pub(crate) use ioctl;

/// Controller and peripheral endpoints of one pseudo-terminal
///
/// The peripheral is taken by the process launcher and closed on this side
/// once the child has inherited it. The controller lives until [`close`].
///
/// [`close`]: PtyPair::close
#[derive(Debug)]
pub struct PtyPair {
    controller: Option<OwnedFd>,
    peripheral: Option<OwnedFd>,
    peripheral_path: PathBuf,
}

impl PtyPair {
    pub(crate) fn new(controller: OwnedFd, peripheral: OwnedFd, peripheral_path: PathBuf) -> Self {
        Self {
            controller: Some(controller),
            peripheral: Some(peripheral),
            peripheral_path,
        }
    }

    /// The controller endpoint, if the pair is still open
    pub fn controller(&self) -> Option<BorrowedFd<'_>> {
        self.controller.as_ref().map(|fd| fd.as_fd())
    }

    /// The peripheral endpoint, until it is handed to a child
    pub fn peripheral(&self) -> Option<BorrowedFd<'_>> {
        self.peripheral.as_ref().map(|fd| fd.as_fd())
    }

    /// Device path of the peripheral endpoint
    pub fn peripheral_path(&self) -> &Path {
        &self.peripheral_path
    }

    /// Take ownership of the controller endpoint
    pub fn take_controller(&mut self) -> Option<OwnedFd> {
        self.controller.take()
    }

    /// Take ownership of the peripheral endpoint
    pub fn take_peripheral(&mut self) -> Option<OwnedFd> {
        self.peripheral.take()
    }

    /// Set the window size. No-op once the controller is closed.
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        match self.controller() {
            Some(fd) => set_winsize(fd, size).map_err(Error::Io),
            None => Ok(()),
        }
    }

    /// Current window size of the pair
    pub fn size(&self) -> Result<TerminalSize> {
        match self.controller() {
            Some(fd) => get_winsize(fd).map_err(Error::Io),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "pty pair is closed",
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.controller.is_none()
    }

    /// Release both endpoints. Safe to call more than once.
    pub fn close(&mut self) {
        self.controller = None;
        self.peripheral = None;
    }
}

/// Apply a window size to a terminal descriptor (`TIOCSWINSZ`)
pub fn set_winsize(fd: BorrowedFd<'_>, size: TerminalSize) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    ioctl!(fd, libc::TIOCSWINSZ, &ws as *const libc::winsize)
}

/// Read the window size of a terminal descriptor (`TIOCGWINSZ`)
pub fn get_winsize(fd: BorrowedFd<'_>) -> io::Result<TerminalSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    ioctl!(fd, libc::TIOCGWINSZ, &mut ws as *mut libc::winsize)?;
    Ok(TerminalSize::new(ws.ws_col, ws.ws_row))
}

/// Open a terminal device read/write without acquiring it as controlling tty
pub(crate) fn open_device(path: &Path) -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)?;
    Ok(OwnedFd::from(file))
}

/// Whether an `open` failure means the multiplexing device is absent or forbidden
pub(crate) fn device_unavailable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EACCES) | Some(libc::EPERM)
    )
}

/// Whether an ioctl failure means the request is unsupported on this kernel
pub(crate) fn unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTTY) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
    )
}

/// Length of a NUL-terminated name stored in a fixed buffer
#[allow(dead_code)]
pub(crate) fn clen(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == 0).unwrap_or(buf.len())
}

/// Resolve the device path behind a descriptor through `/dev/fd`
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub(crate) fn readlink_fd(fd: BorrowedFd<'_>) -> io::Result<PathBuf> {
    use std::os::fd::AsRawFd;

    std::fs::read_link(format!("/dev/fd/{}", fd.as_raw_fd()))
}

/// Mark a raw-opened descriptor close-on-exec
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub(crate) fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: fcntl on a live borrowed descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open the controller via `posix_openpt`
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub(crate) fn posix_openpt() -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    // SAFETY: posix_openpt returns a fresh descriptor or -1.
    let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned to us and is owned by nobody else.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(owned.as_fd())?;
    Ok(owned)
}

/// `grantpt` + `unlockpt` on a controller opened with `posix_openpt`
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub(crate) fn grant_and_unlock(fd: BorrowedFd<'_>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: both calls only inspect the descriptor.
    if unsafe { libc::grantpt(fd.as_raw_fd()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::unlockpt(fd.as_raw_fd()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

//! Darwin backends
//!
//! [`DarwinBackend`] is the streamlined path (`posix_openpt`, `grantpt`,
//! `unlockpt`). [`DarwinLegacyBackend`] drives the ptmx ioctls directly and
//! fixes up peripheral ownership itself, for systems where the libc helpers
//! are unavailable.

use std::fs;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    clen, device_unavailable, grant_and_unlock, ioctl, open_device, posix_openpt, readlink_fd,
    unsupported, LegacyBackend, PtyPair, PTMX,
};
use crate::error::{Error, Result};
use crate::pty::{PtyBackend, TerminalSize};

/// `_IOC(IOC_OUT, 't', 83, 128)`: copy the peripheral name
const TIOCPTYGNAME: libc::c_ulong = 0x4080_7453;
/// `_IO('t', 82)`: unlock the peripheral
const TIOCPTYUNLK: libc::c_ulong = 0x2000_7452;

/// Size of the name buffer filled by `TIOCPTYGNAME`
const NAME_BUFFER_LEN: usize = 128;

/// Streamlined Darwin allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct DarwinBackend;

/// Darwin allocator driving the ptmx ioctls by hand
#[derive(Debug, Default, Clone, Copy)]
pub struct DarwinLegacyBackend;

/// Peripheral name via `TIOCPTYGNAME`, or `/dev/fd` when the ioctl is unsupported
fn peripheral_name(controller: BorrowedFd<'_>) -> io::Result<PathBuf> {
    let mut name = [0u8; NAME_BUFFER_LEN];
    match ioctl!(controller, TIOCPTYGNAME, name.as_mut_ptr()) {
        Ok(()) => {
            let name = String::from_utf8_lossy(&name[..clen(&name)]).into_owned();
            if name.starts_with("/dev/") {
                Ok(PathBuf::from(name))
            } else {
                Ok(Path::new("/dev").join(name))
            }
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOTTY) => {
            debug!("TIOCPTYGNAME unsupported, resolving peripheral through /dev/fd");
            readlink_fd(controller)
        }
        Err(e) => Err(e),
    }
}

impl PtyBackend for DarwinBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        let controller = match posix_openpt() {
            Ok(fd) => fd,
            Err(e) if device_unavailable(&e) => {
                warn!("posix_openpt unavailable ({}), scanning legacy pty devices", e);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("posix_openpt", e)),
        };

        if let Err(e) = grant_and_unlock(controller.as_fd()) {
            if unsupported(&e) {
                warn!("grantpt/unlockpt unsupported ({}), using ptmx ioctls", e);
                drop(controller);
                return DarwinLegacyBackend.allocate(size);
            }
            return Err(Error::allocation("grantpt/unlockpt", e));
        }

        let peripheral_path = match peripheral_name(controller.as_fd()) {
            Ok(path) => path,
            Err(e) if unsupported(&e) => {
                warn!("cannot name peripheral ({}), scanning legacy pty devices", e);
                drop(controller);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("ioctl(TIOCPTYGNAME)", e)),
        };

        let peripheral = open_device(&peripheral_path)
            .map_err(|e| Error::allocation("open(peripheral)", e))?;

        let pair = PtyPair::new(controller, peripheral, peripheral_path);
        pair.resize(size)?;
        debug!("allocated pty {}", pair.peripheral_path().display());
        Ok(pair)
    }
}

impl PtyBackend for DarwinLegacyBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        let controller = match open_device(Path::new(PTMX)) {
            Ok(fd) => fd,
            Err(e) if device_unavailable(&e) => {
                warn!("{} unavailable ({}), scanning legacy pty devices", PTMX, e);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("open(/dev/ptmx)", e)),
        };

        let peripheral_path = match peripheral_name(controller.as_fd()) {
            Ok(path) => path,
            Err(e) if unsupported(&e) => {
                warn!("cannot name peripheral ({}), scanning legacy pty devices", e);
                drop(controller);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("ioctl(TIOCPTYGNAME)", e)),
        };

        // grantpt equivalent: hand the peripheral to the calling user, group-writable.
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        std::os::unix::fs::chown(&peripheral_path, Some(uid), Some(gid))
            .map_err(|e| Error::allocation("grantpt: chown", e))?;
        fs::set_permissions(&peripheral_path, fs::Permissions::from_mode(0o620))
            .map_err(|e| Error::allocation("grantpt: chmod", e))?;

        ioctl!(controller, TIOCPTYUNLK, 0 as libc::c_int)
            .map_err(|e| Error::allocation("ioctl(TIOCPTYUNLK)", e))?;

        let peripheral = open_device(&peripheral_path)
            .map_err(|e| Error::allocation("open(peripheral)", e))?;

        let pair = PtyPair::new(controller, peripheral, peripheral_path);
        pair.resize(size)?;
        debug!("allocated pty {} via ptmx ioctls", pair.peripheral_path().display());
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streamlined_allocation() {
        let pair = DarwinBackend.allocate(TerminalSize::new(90, 20)).unwrap();
        assert!(pair.peripheral_path().starts_with("/dev/"));
        assert_eq!(pair.size().unwrap(), TerminalSize::new(90, 20));
    }
}

//! FreeBSD, DragonFly and NetBSD backends

#[cfg(target_os = "netbsd")]
use std::io;
#[cfg(target_os = "netbsd")]
use std::path::Path;
use std::path::PathBuf;

use tracing::{debug, warn};

#[cfg(target_os = "netbsd")]
use super::{clen, PTMX};
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
use super::{grant_and_unlock, posix_openpt, readlink_fd};
use super::{device_unavailable, ioctl, open_device, unsupported, LegacyBackend, PtyPair};
use crate::error::{Error, Result};
use crate::pty::{PtyBackend, TerminalSize};

/// Allocates pairs with `posix_openpt` and names the peripheral with `TIOCGPTN`
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct FreeBsdBackend;

/// `_IOR('t', 15, int)`
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
const TIOCGPTN: libc::c_ulong = 0x4004_740f;

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
impl PtyBackend for FreeBsdBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        use std::os::fd::AsFd;

        let controller = match posix_openpt() {
            Ok(fd) => fd,
            Err(e) if device_unavailable(&e) => {
                warn!("posix_openpt unavailable ({}), scanning legacy pty devices", e);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("posix_openpt", e)),
        };
        grant_and_unlock(controller.as_fd())
            .map_err(|e| Error::allocation("grantpt/unlockpt", e))?;

        let mut index: libc::c_int = 0;
        let peripheral_path = match ioctl!(controller, TIOCGPTN, &mut index as *mut libc::c_int) {
            Ok(()) => PathBuf::from(format!("/dev/pts/{index}")),
            Err(e) if unsupported(&e) => match readlink_fd(controller.as_fd()) {
                Ok(path) => path,
                Err(link_err) => {
                    warn!(
                        "TIOCGPTN unsupported ({}) and /dev/fd lookup failed ({}), scanning legacy pty devices",
                        e, link_err
                    );
                    drop(controller);
                    return LegacyBackend.allocate(size);
                }
            },
            Err(e) => return Err(Error::allocation("ioctl(TIOCGPTN)", e)),
        };

        let peripheral = open_device(&peripheral_path)
            .map_err(|e| Error::allocation("open(peripheral)", e))?;

        let pair = PtyPair::new(controller, peripheral, peripheral_path);
        pair.resize(size)?;
        debug!("allocated pty {}", pair.peripheral_path().display());
        Ok(pair)
    }
}

/// Allocates pairs through `/dev/ptmx` with `TIOCGRANTPT` and `TIOCPTSNAME`
#[cfg(target_os = "netbsd")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NetBsdBackend;

/// `_IO('t', 71)`
#[cfg(target_os = "netbsd")]
const TIOCGRANTPT: libc::c_ulong = 0x2000_7447;
/// `_IOR('t', 72, struct ptmget)`
#[cfg(target_os = "netbsd")]
const TIOCPTSNAME: libc::c_ulong = 0x4028_7448;

/// `struct ptmget` from `<sys/ttycom.h>`
#[cfg(target_os = "netbsd")]
#[repr(C)]
struct PtmGet {
    cfd: libc::c_int,
    sfd: libc::c_int,
    cn: [u8; 16],
    sn: [u8; 16],
}

#[cfg(target_os = "netbsd")]
impl PtyBackend for NetBsdBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        let controller = match open_device(Path::new(PTMX)) {
            Ok(fd) => fd,
            Err(e) if device_unavailable(&e) => {
                warn!("{} unavailable ({}), scanning legacy pty devices", PTMX, e);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("open(/dev/ptmx)", e)),
        };

        ioctl!(controller, TIOCGRANTPT, 0 as libc::c_int)
            .map_err(|e| Error::allocation("ioctl(TIOCGRANTPT)", e))?;

        let mut names = PtmGet {
            cfd: -1,
            sfd: -1,
            cn: [0; 16],
            sn: [0; 16],
        };
        if let Err(e) = ioctl!(controller, TIOCPTSNAME, &mut names as *mut PtmGet) {
            if unsupported(&e) {
                warn!("TIOCPTSNAME unsupported ({}), scanning legacy pty devices", e);
                drop(controller);
                return LegacyBackend.allocate(size);
            }
            return Err(Error::allocation("ioctl(TIOCPTSNAME)", e));
        }
        let name = String::from_utf8_lossy(&names.sn[..clen(&names.sn)]).into_owned();
        if name.is_empty() {
            return Err(Error::allocation(
                "ioctl(TIOCPTSNAME)",
                io::Error::new(io::ErrorKind::InvalidData, "empty peripheral name"),
            ));
        }
        let peripheral_path = PathBuf::from(name);

        let peripheral = open_device(&peripheral_path)
            .map_err(|e| Error::allocation("open(peripheral)", e))?;

        let pair = PtyPair::new(controller, peripheral, peripheral_path);
        pair.resize(size)?;
        debug!("allocated pty {}", pair.peripheral_path().display());
        Ok(pair)
    }
}

//! Linux backend: `/dev/ptmx` with `TIOCGPTN` and `TIOCSPTLCK`

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{device_unavailable, ioctl, open_device, unsupported, LegacyBackend, PtyPair, PTMX};
use crate::error::{Error, Result};
use crate::pty::{PtyBackend, TerminalSize};

/// Allocates pairs through the devpts multiplexer
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxBackend;

impl PtyBackend for LinuxBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        let controller = match open_device(Path::new(PTMX)) {
            Ok(fd) => fd,
            Err(e) if device_unavailable(&e) => {
                warn!("{} unavailable ({}), scanning legacy pty devices", PTMX, e);
                return LegacyBackend.allocate(size);
            }
            Err(e) => return Err(Error::allocation("open(/dev/ptmx)", e)),
        };

        let mut index: libc::c_uint = 0;
        if let Err(e) = ioctl!(controller, libc::TIOCGPTN, &mut index as *mut libc::c_uint) {
            if unsupported(&e) {
                warn!("TIOCGPTN not supported ({}), scanning legacy pty devices", e);
                drop(controller);
                return LegacyBackend.allocate(size);
            }
            return Err(Error::allocation("ioctl(TIOCGPTN)", e));
        }
        let peripheral_path = PathBuf::from(format!("/dev/pts/{index}"));

        let mut lock: libc::c_int = 0;
        ioctl!(controller, libc::TIOCSPTLCK, &mut lock as *mut libc::c_int)
            .map_err(|e| Error::allocation("ioctl(TIOCSPTLCK)", e))?;

        let peripheral = open_device(&peripheral_path)
            .map_err(|e| Error::allocation("open(peripheral)", e))?;

        let pair = PtyPair::new(controller, peripheral, peripheral_path);
        pair.resize(size)?;
        debug!("allocated pty {}", pair.peripheral_path().display());
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_lives_under_devpts() {
        let pair = LinuxBackend.allocate(TerminalSize::default()).unwrap();
        let path = pair.peripheral_path().to_string_lossy().into_owned();
        assert!(path.starts_with("/dev/pts/"), "unexpected peripheral {path}");
        assert!(path["/dev/pts/".len()..].parse::<u32>().is_ok());
    }

    #[test]
    fn test_pairs_are_distinct() {
        let a = LinuxBackend.allocate(TerminalSize::default()).unwrap();
        let b = LinuxBackend.allocate(TerminalSize::default()).unwrap();
        assert_ne!(a.peripheral_path(), b.peripheral_path());
    }
}

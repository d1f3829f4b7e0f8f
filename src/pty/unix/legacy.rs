//! Legacy BSD-style pty enumeration
//!
//! Scans the pre-created `/dev/ptyXY` controllers and pairs each with the
//! `/dev/ttyXY` peripheral of the same name. Used directly on OpenBSD and as
//! the fallback everywhere else when the multiplexing device is missing.

use std::io;
use std::path::PathBuf;

use tracing::debug;

use super::{open_device, PtyPair};
use crate::error::{Error, Result};
use crate::pty::{PtyBackend, TerminalSize};

/// Device letters of the classic BSD pty namespace
const SERIES: &[u8] = b"pqrstuvwxyzPQRST";

/// Hex digits used as the second character of the device name
const UNITS: &[u8] = b"0123456789abcdef";

/// Allocates pairs by probing the fixed legacy device namespace
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyBackend;

/// `(controller, peripheral)` device names for a slot in the namespace
pub(crate) fn device_names(slot: usize) -> Option<(PathBuf, PathBuf)> {
    let letter = *SERIES.get(slot / UNITS.len())? as char;
    let unit = UNITS[slot % UNITS.len()] as char;
    Some((
        PathBuf::from(format!("/dev/pty{letter}{unit}")),
        PathBuf::from(format!("/dev/tty{letter}{unit}")),
    ))
}

impl PtyBackend for LegacyBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        let slots = SERIES.len() * UNITS.len();

        for slot in 0..slots {
            let Some((controller_path, peripheral_path)) = device_names(slot) else {
                break;
            };

            // Busy or missing controllers are skipped, the next slot may be free.
            let Ok(controller) = open_device(&controller_path) else {
                continue;
            };
            let Ok(peripheral) = open_device(&peripheral_path) else {
                continue;
            };

            let pair = PtyPair::new(controller, peripheral, peripheral_path);
            pair.resize(size)?;
            debug!("allocated legacy pty {}", controller_path.display());
            return Ok(pair);
        }

        Err(Error::allocation(
            "scan(/dev/pty*)",
            io::Error::new(io::ErrorKind::NotFound, "out of pty devices"),
        ))
    }
}

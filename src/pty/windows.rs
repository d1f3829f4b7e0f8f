//! Windows pseudo-console backend
//!
//! Two anonymous pipes carry the byte streams; the child-owned ends are bound
//! to a pseudo console and closed on the host side. Every kernel object is
//! held by an RAII owner from the moment it exists, so an early return at any
//! step releases whatever was already created.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;
use windows_sys::Win32::Foundation::{SetHandleInformation, HANDLE, HANDLE_FLAG_INHERIT, S_OK};
use windows_sys::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, UpdateProcThreadAttribute,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
};

use crate::error::{Error, Result};
use crate::pty::{PtyBackend, TerminalSize};

/// Backend used on this target
pub type NativeBackend = ConPtyBackend;

/// Allocates pairs backed by a host pseudo console
#[derive(Debug, Default, Clone, Copy)]
pub struct ConPtyBackend;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}

/// Owned pseudo-console handle, closed on drop
struct PseudoConsole(HPCON);

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        // SAFETY: the handle came from CreatePseudoConsole and is closed once.
        unsafe { ClosePseudoConsole(self.0) };
    }
}

/// Process-thread attribute list holding the pseudo console, deleted on drop
struct AttributeList {
    // usize storage keeps the list pointer-aligned.
    storage: Vec<usize>,
}

impl AttributeList {
    fn with_pseudo_console(console: &PseudoConsole) -> io::Result<Self> {
        let mut size = 0usize;
        // SAFETY: a null list with a size pointer queries the required size.
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size) };
        if size == 0 {
            return Err(io::Error::last_os_error());
        }

        let words = size.div_ceil(mem::size_of::<usize>());
        let mut storage = vec![0usize; words];
        // SAFETY: storage is at least `size` bytes and pointer-aligned.
        if unsafe { InitializeProcThreadAttributeList(storage.as_mut_ptr().cast(), 1, 0, &mut size) }
            == 0
        {
            return Err(io::Error::last_os_error());
        }
        let list = Self { storage };

        // SAFETY: the list was initialized above; the pseudo console value is
        // passed by value as the attribute payload.
        let ok = unsafe {
            UpdateProcThreadAttribute(
                list.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                console.0 as *const c_void,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(list)
    }

    fn as_ptr(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.storage.as_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        // SAFETY: the list was successfully initialized before Self existed.
        unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
    }
}

/// Create an anonymous pipe, returning `(read, write)`
fn pipe() -> io::Result<(OwnedHandle, OwnedHandle)> {
    let mut read: HANDLE = 0;
    let mut write: HANDLE = 0;
    // SAFETY: both out-pointers are valid; default security attributes.
    if unsafe { CreatePipe(&mut read, &mut write, ptr::null(), 0) } == 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: CreatePipe succeeded, both handles are fresh and owned by us.
    unsafe {
        Ok((
            OwnedHandle::from_raw_handle(read as RawHandle),
            OwnedHandle::from_raw_handle(write as RawHandle),
        ))
    }
}

fn no_inherit(handle: &OwnedHandle) -> io::Result<()> {
    // SAFETY: live handle owned by the caller.
    if unsafe { SetHandleInformation(raw(handle), HANDLE_FLAG_INHERIT, 0) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn coord(size: TerminalSize) -> COORD {
    COORD {
        X: size.cols.min(i16::MAX as u16) as i16,
        Y: size.rows.min(i16::MAX as u16) as i16,
    }
}

/// Host side of a pseudo console: the two pipe ends, the console itself and
/// the attribute list used to attach a child to it
pub struct PtyPair {
    console: Mutex<Option<PseudoConsole>>,
    attributes: Option<AttributeList>,
    input: Mutex<Option<File>>,
    output: Mutex<Option<File>>,
    size: Mutex<TerminalSize>,
}

impl PtyPair {
    /// Attribute list to pass in `STARTUPINFOEXW`, until released
    pub(crate) fn attribute_list(&self) -> Option<LPPROC_THREAD_ATTRIBUTE_LIST> {
        self.attributes.as_ref().map(AttributeList::as_ptr)
    }

    /// Release the attribute list once the child process exists
    pub(crate) fn release_attributes(&mut self) {
        self.attributes = None;
    }

    /// A new handle to the host write end (child's stdin)
    pub fn clone_input(&self) -> io::Result<File> {
        match lock(&self.input).as_ref() {
            Some(file) => file.try_clone(),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// A new handle to the host read end (child's output)
    pub fn clone_output(&self) -> io::Result<File> {
        match lock(&self.output).as_ref() {
            Some(file) => file.try_clone(),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Close the host write end only
    pub fn close_input(&self) {
        lock(&self.input).take();
    }

    /// Close the pseudo console, which ends the child's output stream
    pub fn close_console(&self) {
        if lock(&self.console).take().is_some() {
            debug!("pseudo console closed");
        }
    }

    /// Resize the pseudo console. No-op once it has been closed.
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let console = lock(&self.console);
        let Some(console) = console.as_ref() else {
            return Ok(());
        };
        // SAFETY: the pseudo console is alive while the lock is held.
        let hr = unsafe { ResizePseudoConsole(console.0, coord(size)) };
        if hr != S_OK {
            return Err(Error::Io(io::Error::from_raw_os_error(hr)));
        }
        *lock(&self.size) = size;
        Ok(())
    }

    /// Last geometry applied to the pseudo console
    pub fn size(&self) -> Result<TerminalSize> {
        if self.is_closed() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "pseudo console is closed",
            )));
        }
        Ok(*lock(&self.size))
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.console).is_none()
    }

    /// Release the console and both pipe ends. Safe to call more than once.
    pub fn close(&self) {
        self.close_console();
        self.close_input();
        lock(&self.output).take();
    }
}

impl PtyBackend for ConPtyBackend {
    fn allocate(&self, size: TerminalSize) -> Result<PtyPair> {
        let size = size.or_default();

        // The child reads `child_in` and writes `child_out`; the host keeps the other ends.
        let (child_in, host_in) =
            pipe().map_err(|e| Error::allocation("CreatePipe(input)", e))?;
        let (host_out, child_out) =
            pipe().map_err(|e| Error::allocation("CreatePipe(output)", e))?;

        no_inherit(&host_in).map_err(|e| Error::allocation("SetHandleInformation(input)", e))?;
        no_inherit(&host_out).map_err(|e| Error::allocation("SetHandleInformation(output)", e))?;

        let mut hpc: HPCON = 0;
        // SAFETY: both pipe handles are live; hpc is a valid out-pointer.
        let hr = unsafe { CreatePseudoConsole(coord(size), raw(&child_in), raw(&child_out), 0, &mut hpc) };
        if hr != S_OK {
            return Err(Error::allocation(
                "CreatePseudoConsole",
                io::Error::from_raw_os_error(hr),
            ));
        }
        let console = PseudoConsole(hpc);

        // The pseudo console holds its own references to the child-side ends.
        drop(child_in);
        drop(child_out);

        let attributes = AttributeList::with_pseudo_console(&console)
            .map_err(|e| Error::allocation("UpdateProcThreadAttribute", e))?;

        debug!("allocated pseudo console {}x{}", size.cols, size.rows);
        Ok(PtyPair {
            console: Mutex::new(Some(console)),
            attributes: Some(attributes),
            input: Mutex::new(Some(File::from(host_in))),
            output: Mutex::new(Some(File::from(host_out))),
            size: Mutex::new(size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_resize() {
        let pair = ConPtyBackend.allocate(TerminalSize::new(100, 30)).unwrap();
        assert!(pair.attribute_list().is_some());
        assert_eq!(pair.size().unwrap(), TerminalSize::new(100, 30));

        pair.resize(TerminalSize::new(120, 40)).unwrap();
        assert_eq!(pair.size().unwrap(), TerminalSize::new(120, 40));
    }

    #[test]
    fn test_resize_after_close_is_noop() {
        let pair = ConPtyBackend.allocate(TerminalSize::default()).unwrap();
        pair.close();
        pair.close();
        assert!(pair.resize(TerminalSize::new(10, 10)).is_ok());
        assert!(pair.size().is_err());
    }
}

//! Named pipe helpers

use std::ffi::CString;
use std::fs::{OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Outcome of [`ensure_fifo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoStatus {
    /// The path was missing and a FIFO was created
    Created,
    /// A FIFO already exists at the path
    Existing,
    /// Something other than a FIFO exists at the path
    NotFifo,
}

pub fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

/// Create a FIFO at `path` with permission bits `mode` unless something
/// already exists there. Missing parent directories are created.
pub fn ensure_fifo(path: &Path, mode: u32) -> io::Result<FifoStatus> {
    match std::fs::metadata(path) {
        Ok(m) if m.file_type().is_fifo() => return Ok(FifoStatus::Existing),
        Ok(_) => return Ok(FifoStatus::NotFifo),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // Lost a race with another creator
        if err.kind() == io::ErrorKind::AlreadyExists && is_fifo(path) {
            return Ok(FifoStatus::Existing);
        }
        return Err(err);
    }

    // mkfifo is subject to the umask
    std::fs::set_permissions(path, Permissions::from_mode(mode))?;
    Ok(FifoStatus::Created)
}

/// Write a single newline into the FIFO without blocking, so a reader stuck
/// in `open` or `read` wakes up. Does nothing when `path` is not a FIFO or
/// no reader is present.
pub fn unblock_reader(path: &Path) -> io::Result<()> {
    if !is_fifo(path) {
        return Ok(());
    }

    let mut pipe = match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(pipe) => pipe,
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(()),
        Err(e) => return Err(e),
    };

    match pipe.write_all(b"\n") {
        Ok(()) => Ok(()),
        // Pipe buffer full: the reader has data to wake up on anyway
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

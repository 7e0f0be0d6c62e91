//! Filesystem path resolution for executables.

use crate::errors::{Error, ErrorKind, Result};
use nix::errno::Errno;
use nix::unistd::{access, AccessFlags, Pid};
use std::env;
use std::io;
use std::path::{Path, PathBuf};

fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Resolves `path` to an absolute canonical path. A path that does not exist
/// is FILE_NOT_FOUND; any other failure is SYSTEM_ERROR.
pub fn real_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    match path.as_ref().canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(Error::code(ErrorKind::FileNotFound))
        }
        Err(err) => Err(Error::errno_msg(
            ErrorKind::SystemError,
            io_errno(&err),
            "real path",
        )),
    }
}

/// Walks the colon-separated `PATH` entries and returns the first
/// `<dir>/<command>` that is executable.
pub fn find_in_path(command: impl AsRef<Path>) -> Result<PathBuf> {
    let path = match env::var_os("PATH") {
        Some(path) => path,
        None => return Err(Error::code(ErrorKind::FileNotFound)),
    };

    for dir in env::split_paths(&path) {
        let candidate = dir.join(command.as_ref());
        if access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(candidate);
        }
    }

    Err(Error::code(ErrorKind::FileNotFound))
}

/// Resolves user input to an executable path: tries [`real_path`] first and
/// falls back to a `PATH` search when the input names no existing file.
pub fn canonical_path(input: impl AsRef<Path>) -> Result<PathBuf> {
    match real_path(input.as_ref()) {
        Ok(path) => Ok(path),
        Err(err) if err.kind == ErrorKind::FileNotFound => find_in_path(input.as_ref()),
        Err(err) => Err(err),
    }
}

/// The canonical path of the executable a running process was loaded from.
pub fn real_path_of_pid(pid: Pid) -> Result<PathBuf> {
    real_path(format!("/proc/{}/exe", pid))
}

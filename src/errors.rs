//! Thread-local error channel.
//!
//! Every fallible operation in the library returns a [`Result`] whose error
//! variant carries a structured record: the error kind, the OS errno (when
//! one was involved) and a formatted message. Constructing an [`Error`] also
//! stores a copy of the record in a thread-local cell, so a caller that only
//! saw "something failed" can still fetch the full story afterwards via
//! [`last_error`]. Informational conditions reported by the control engine
//! (process exited, breakpoint hit, ...) pass through the same channel.

use nix::errno::Errno;
use std::cell::RefCell;
use thiserror::Error as ThisError;

/// Every condition the library can report, informational kinds included.
/// `Ok` compares equal to zero; any other kind signals a condition the
/// caller may want to surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ThisError)]
#[repr(i32)]
pub enum ErrorKind {
    #[error("Ok")]
    Ok = 0,

    #[error("Something went wrong")]
    Failure,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Invalid operation in current state")]
    InvalidState,
    #[error("File not found or not accessible")]
    FileNotFound,
    #[error("File is not executable")]
    NotExecutable,

    #[error("Process does not exist")]
    ProcNotFound,
    #[error("Process is not being traced")]
    ProcNotAttached,
    #[error("Process is already being traced")]
    ProcAlreadyAttached,
    #[error("Process has exited normally")]
    ProcExited,
    #[error("Process was terminated by signal")]
    ProcTerminated,
    #[error("Process is running (not stopped)")]
    ProcRunning,
    #[error("Process is stopped")]
    ProcStopped,
    #[error("Process is in zombie state")]
    ProcZombie,
    #[error("Error in child process")]
    ProcChild,

    #[error("System error")]
    SystemError,
    #[error("Fork failed")]
    ForkFailed,
    #[error("Pipe creation failed")]
    PipeFailed,
    #[error("Wait for process failed")]
    WaitpidFailed,
    #[error("Exec failed")]
    ExecFailed,
    #[error("Kill signal failed")]
    KillFailed,

    #[error("Ptrace operation failed")]
    PtraceError,
    #[error("Could not attach to process")]
    PtraceAttachFailed,
    #[error("Could not detach from process")]
    PtraceDetachFailed,
    #[error("Could not continue process")]
    PtraceContFailed,
    #[error("Single step failed")]
    PtraceStepFailed,
    #[error("Get registers failed")]
    PtraceGetregsFailed,
    #[error("Set registers failed")]
    PtraceSetregsFailed,
    #[error("Peek text failed")]
    PtracePeektextFailed,
    #[error("Poke text failed")]
    PtracePoketextFailed,
    #[error("Peek data failed")]
    PtracePeekdataFailed,
    #[error("Poke data failed")]
    PtracePokedataFailed,

    #[error("Breakpoint already exists at this address")]
    BreakpointAlreadyExists,
    #[error("No breakpoint at this address")]
    BreakpointNotFound,
    #[error("Breakpoint limit reached")]
    BreakpointLimitReached,
    #[error("Breakpoint hit")]
    BreakpointHit,

    #[error("Could not read ELF symbols")]
    ElfFailed,
    #[error("No DWARF debug information")]
    DwarfNotFound,
    #[error("Symbol not found")]
    SymbolNotFound,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A structured error: kind + optional OS errno + human-readable message.
#[derive(Clone, Debug, ThisError)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub errno: Option<Errno>,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static LAST_ERROR: RefCell<(ErrorKind, Option<Errno>, String)> =
        RefCell::new((ErrorKind::Ok, None, String::new()));
}

/// Stores a record in the thread-local cell. Called by every [`Error`]
/// constructor and by the control engine when it reports informational
/// events, so [`last_error`] always reflects the most recent condition.
pub(crate) fn record(kind: ErrorKind, errno: Option<Errno>, message: &str) {
    LAST_ERROR.with(|cell| {
        let mut slot = cell.borrow_mut();
        slot.0 = kind;
        slot.1 = errno;
        slot.2.clear();
        slot.2.push_str(message);
    });
}

/// The message of the most recent error or report on this thread.
pub fn last_error() -> String {
    LAST_ERROR.with(|cell| cell.borrow().2.clone())
}

/// The kind of the most recent error or report on this thread.
pub fn last_error_kind() -> ErrorKind {
    LAST_ERROR.with(|cell| cell.borrow().0)
}

impl Error {
    /// Canonical text of `kind`, no OS context.
    pub fn code(kind: ErrorKind) -> Error {
        let message = kind.to_string();
        record(kind, None, &message);
        Error {
            kind,
            errno: None,
            message,
        }
    }

    /// Message is the OS-level description of `errno`.
    pub fn errno(kind: ErrorKind, errno: Errno) -> Error {
        let message = errno.desc().to_string();
        record(kind, Some(errno), &message);
        Error {
            kind,
            errno: Some(errno),
            message,
        }
    }

    /// `prefix` + ": " + OS-level description of `errno`.
    pub fn errno_msg(kind: ErrorKind, errno: Errno, prefix: impl AsRef<str>) -> Error {
        let message = format!("{}: {}", prefix.as_ref(), errno.desc());
        record(kind, Some(errno), &message);
        Error {
            kind,
            errno: Some(errno),
            message,
        }
    }

    /// Purely formatted message.
    pub fn msg(kind: ErrorKind, message: impl Into<String>) -> Error {
        let message = message.into();
        record(kind, None, &message);
        Error {
            kind,
            errno: None,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_zero() {
        assert_eq!(ErrorKind::Ok.code(), 0);
        assert_ne!(ErrorKind::Failure.code(), 0);
    }

    #[test]
    fn constructors_record_last_error() {
        let err = Error::msg(ErrorKind::ProcNotFound, "Process 42 doesn't exist");
        assert_eq!(err.kind, ErrorKind::ProcNotFound);
        assert_eq!(last_error(), "Process 42 doesn't exist");
        assert_eq!(last_error_kind(), ErrorKind::ProcNotFound);

        // A later record replaces the earlier one.
        let _ = Error::code(ErrorKind::InvalidState);
        assert_eq!(last_error(), "Invalid operation in current state");
    }

    #[test]
    fn errno_msg_appends_os_description() {
        let err = Error::errno_msg(ErrorKind::WaitpidFailed, Errno::ECHILD, "waitpid");
        assert!(err.message.starts_with("waitpid: "));
        assert_eq!(err.errno, Some(Errno::ECHILD));
        assert_eq!(last_error(), err.message);
    }
}

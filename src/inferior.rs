//! The inferior control engine.
//!
//! An [`Inferior`] owns one traced child process and mediates every kernel
//! trace-control call against it. The engine keeps a cached view of the
//! child's lifecycle state and *reconciles* that view with the kernel (a
//! non-blocking or blocking wait) before and after every operation that
//! depends on it. Breakpoints are kept "set" from the user's point of view
//! even while no child exists: spawning or attaching re-installs every
//! logically-enabled record into the fresh address space.

use crate::auxv::{self, AuxvEntry};
use crate::breakpoint::BreakpointTable;
use crate::disasm::{self, Instruction};
use crate::errors::{self, Error, ErrorKind, Result};
use crate::paths;
use crate::symbols::{self, SymbolTable};
use libc::user_regs_struct;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{access, execvp, fork, pipe2, setpgid, AccessFlags, ForkResult, Pid};
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

static NEXT_INFERIOR_ID: AtomicU32 = AtomicU32::new(0);
static LIVE_INFERIORS: AtomicUsize = AtomicUsize::new(0);

/// Number of inferiors currently alive in this process.
pub fn live_inferior_count() -> usize {
    LIVE_INFERIORS.load(Ordering::SeqCst)
}

/// Lifecycle state of the traced child.
///
/// `Running` and `Stopped` imply a real kernel process exists under our
/// trace; every other state implies there is no child.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InferiorState {
    None,
    Running,
    Stopped,
    Exited,
    Terminated,
}

impl fmt::Display for InferiorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            InferiorState::None => "none",
            InferiorState::Running => "running",
            InferiorState::Stopped => "stopped",
            InferiorState::Exited => "exited",
            InferiorState::Terminated => "terminated",
        };
        f.write_str(text)
    }
}

/// What the kernel told us about the child during a reconcile. Operations
/// that let the child run return the event observed at the next stop.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Event {
    /// No state change observed.
    None,
    /// The child was resumed (SIGCONT observed).
    Running,
    /// Stopped by a signal that was not one of our traps.
    Stopped { rip: u64 },
    /// Stopped by an `int3` we installed; carries the record's index.
    BreakpointHit { index: usize, addr: u64 },
    /// Normal exit, already reaped.
    Exited { pid: Pid, code: i32 },
    /// Killed by a signal, already reaped.
    Terminated { pid: Pid, signal: Signal },
}

impl Event {
    fn kind(&self) -> ErrorKind {
        match self {
            Event::None | Event::Running => ErrorKind::Ok,
            Event::Stopped { .. } => ErrorKind::ProcStopped,
            Event::BreakpointHit { .. } => ErrorKind::BreakpointHit,
            Event::Exited { .. } => ErrorKind::ProcExited,
            Event::Terminated { .. } => ErrorKind::ProcTerminated,
        }
    }

    fn into_error(self) -> Error {
        Error::msg(self.kind(), self.to_string())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::None => Ok(()),
            Event::Running => write!(f, "Process is running"),
            Event::Stopped { rip } => write!(f, "program stopped at {:#x}", rip),
            Event::BreakpointHit { index, addr } => {
                write!(f, "breakpoint {} at {:#x}", index, addr)
            }
            Event::Exited { pid, code } => {
                write!(f, "Process {} exited with code {}", pid, code)
            }
            Event::Terminated { pid, signal } => {
                write!(f, "Process {} terminated by signal {}", pid, signal)
            }
        }
    }
}

fn addr_ptr(addr: u64) -> ptrace::AddressType {
    addr as usize as ptrace::AddressType
}

/// The debugger's handle to one traced child process.
pub struct Inferior {
    id: u32,
    pid: Option<Pid>,
    state: InferiorState,
    /// True if we obtained the tracee via attach (detach on shutdown),
    /// false if we spawned it (kill on shutdown).
    attached: bool,
    exec_path: Option<PathBuf>,
    args: Option<String>,
    breakpoints: BreakpointTable,
    elf_symbols: SymbolTable,
    dwarf_symbols: SymbolTable,
}

impl Default for Inferior {
    fn default() -> Self {
        Self::new()
    }
}

impl Inferior {
    pub fn new() -> Inferior {
        let id = NEXT_INFERIOR_ID.fetch_add(1, Ordering::SeqCst);
        LIVE_INFERIORS.fetch_add(1, Ordering::SeqCst);
        Inferior {
            id,
            pid: None,
            state: InferiorState::None,
            attached: false,
            exec_path: None,
            args: None,
            breakpoints: BreakpointTable::default(),
            elf_symbols: SymbolTable::default(),
            dwarf_symbols: SymbolTable::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> InferiorState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn exec_path(&self) -> Option<&Path> {
        self.exec_path.as_deref()
    }

    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn elf_symbols(&self) -> &SymbolTable {
        &self.elf_symbols
    }

    pub fn dwarf_symbols(&self) -> &SymbolTable {
        &self.dwarf_symbols
    }

    fn is_active(&self) -> bool {
        matches!(self.state, InferiorState::Running | InferiorState::Stopped)
    }

    /// The tracee's pid while one exists under our trace.
    fn active_pid(&self) -> Option<Pid> {
        if self.is_active() {
            self.pid
        } else {
            None
        }
    }

    fn clear_child(&mut self) {
        self.pid = None;
        self.state = InferiorState::None;
        self.attached = false;
    }

    fn report(&self, event: Event) -> Event {
        let kind = event.kind();
        if kind != ErrorKind::Ok {
            errors::record(kind, None, &event.to_string());
            debug!("inferior {}: {}", self.id, event);
        }
        event
    }

    /// Synchronizes the cached lifecycle state with the kernel's view.
    ///
    /// This is the single source of truth for kernel-driven state
    /// transitions. The non-blocking variant answers "did anything change
    /// since we last looked"; the blocking variant waits for the next stop
    /// and classifies it (breakpoint hit vs. plain signal stop).
    fn reconcile(&mut self, blocking: bool) -> Result<Event> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => {
                return Err(Error::msg(
                    ErrorKind::InvalidState,
                    "Program is not being run",
                ))
            }
        };

        let flags = if blocking {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        let status = loop {
            match waitpid(pid, flags) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return self.reconcile_echild(pid),
                Err(e) => return Err(Error::errno_msg(ErrorKind::WaitpidFailed, e, "waitpid")),
            }
        };

        match status {
            WaitStatus::StillAlive => Ok(Event::None),
            WaitStatus::Exited(_, code) => {
                self.state = InferiorState::Exited;
                self.pid = None;
                self.attached = false;
                Ok(self.report(Event::Exited { pid, code }))
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.state = InferiorState::Terminated;
                self.pid = None;
                self.attached = false;
                Ok(self.report(Event::Terminated { pid, signal }))
            }
            WaitStatus::Stopped(_, _) => {
                self.state = InferiorState::Stopped;
                if !blocking {
                    return Ok(Event::None);
                }

                let info = ptrace::getsiginfo(pid).map_err(|e| {
                    Error::errno_msg(ErrorKind::PtraceError, e, "ptrace get siginfo")
                })?;
                let regs = ptrace::getregs(pid).map_err(|e| {
                    Error::errno_msg(ErrorKind::PtraceGetregsFailed, e, "ptrace get regs")
                })?;

                if info.si_code != libc::SI_KERNEL {
                    return Ok(self.report(Event::Stopped { rip: regs.rip }));
                }

                // A kernel-originated SIGTRAP: rip sits one byte past the
                // trap instruction that fired.
                match self.breakpoints.find(regs.rip.wrapping_sub(1)) {
                    Some(index) => {
                        let addr = regs.rip.wrapping_sub(1);
                        Ok(self.report(Event::BreakpointHit { index, addr }))
                    }
                    None => Ok(Event::None),
                }
            }
            WaitStatus::Continued(_) => {
                self.state = InferiorState::Running;
                Ok(Event::Running)
            }
            other => {
                debug!("inferior {}: unexpected wait status {:?}", self.id, other);
                Ok(Event::None)
            }
        }
    }

    /// The wait said we have no waitable child. Either somebody else traces
    /// the process, or it is gone entirely.
    fn reconcile_echild(&mut self, pid: Pid) -> Result<Event> {
        match signal::kill(pid, None) {
            Ok(()) => Err(Error::msg(
                ErrorKind::ProcNotAttached,
                format!("Process {} exists but is not being traced", pid),
            )),
            Err(Errno::ESRCH) => {
                self.clear_child();
                Err(Error::msg(
                    ErrorKind::ProcNotFound,
                    format!("Process {} doesn't exist", pid),
                ))
            }
            Err(e) => Err(Error::errno_msg(
                ErrorKind::SystemError,
                e,
                "Can't check process status",
            )),
        }
    }

    /// Kills and reaps the child, if one exists. Reports success when the
    /// child is already gone.
    pub fn kill(&mut self) -> Result<()> {
        let pid = match self.active_pid() {
            Some(pid) => pid,
            None => return Ok(()),
        };

        if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
            if e != Errno::ESRCH {
                return Err(Error::errno_msg(ErrorKind::KillFailed, e, "kill"));
            }
            self.clear_child();
            return Ok(());
        }

        loop {
            match waitpid(pid, None) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::errno_msg(ErrorKind::WaitpidFailed, e, "waitpid")),
            }
        }

        info!("inferior {}: killed process {}", self.id, pid);
        self.clear_child();
        Ok(())
    }

    /// Kills a spawned child or detaches from an attached one. A child that
    /// turns out to be already gone counts as success.
    fn terminate_or_detach(&mut self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        let result = if self.attached {
            self.detach()
        } else {
            self.kill()
        };

        match result {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind,
                    ErrorKind::ProcNotFound | ErrorKind::ProcExited | ErrorKind::ProcTerminated
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Sets the executable for future `run()` calls. The input is resolved
    /// through the filesystem first and `PATH` second, must be executable,
    /// and triggers a symbol-table reload.
    pub fn set_exec_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let resolved = paths::canonical_path(path.as_ref())?;
        if let Err(e) = access(&resolved, AccessFlags::X_OK) {
            return Err(Error::errno_msg(
                ErrorKind::NotExecutable,
                e,
                format!("File '{}' is not executable", resolved.display()),
            ));
        }

        self.exec_path = Some(resolved);
        self.reload_symbols()
    }

    /// Sets (or clears) the unparsed argument string for future `run()`s.
    pub fn set_args(&mut self, args: Option<&str>) {
        self.args = args.map(str::to_owned);
    }

    fn reload_symbols(&mut self) -> Result<()> {
        self.elf_symbols = SymbolTable::default();
        self.dwarf_symbols = SymbolTable::default();
        if let Some(path) = self.exec_path.clone() {
            let (elf, dwarf) = symbols::load_tables(&path)?;
            self.elf_symbols = elf;
            self.dwarf_symbols = dwarf;
        }
        Ok(())
    }

    /// Builds the child's argv: the executable path followed by the
    /// shell-word expansion of the argument string. Word splitting honors
    /// quotes and backslash escapes; command and process substitution are
    /// rejected rather than expanded.
    fn build_argv(&self, exec_path: &Path) -> Result<Vec<CString>> {
        let mut words = vec![exec_path.to_string_lossy().into_owned()];
        if let Some(args) = &self.args {
            if args.contains('`') || args.contains("$(") || args.contains("<(") || args.contains(">(") {
                return Err(Error::msg(
                    ErrorKind::InvalidArgument,
                    "Invalid arguments for child process",
                ));
            }
            match shlex::split(args) {
                Some(split) => words.extend(split),
                None => {
                    return Err(Error::msg(
                        ErrorKind::InvalidArgument,
                        "Invalid arguments for child process",
                    ))
                }
            }
        }

        words
            .into_iter()
            .map(|word| CString::new(word).map_err(|_| Error::code(ErrorKind::InvalidArgument)))
            .collect()
    }

    /// Spawns a new child from `exec_path`, replacing any prior one, and
    /// lets it run past the post-exec trap: the returned event is the first
    /// thing that happens to the fresh process (typically a breakpoint hit
    /// or its exit).
    pub fn run(&mut self) -> Result<Event> {
        let exec_path = match self.exec_path.clone() {
            Some(path) => path,
            None => {
                return Err(Error::msg(
                    ErrorKind::FileNotFound,
                    "No executable path specified",
                ))
            }
        };
        if let Err(e) = access(&exec_path, AccessFlags::X_OK) {
            return Err(Error::errno_msg(
                ErrorKind::NotExecutable,
                e,
                format!("File '{}' is not executable", exec_path.display()),
            ));
        }

        self.kill()?;

        let argv = self.build_argv(&exec_path)?;
        let exec_cstr = CString::new(exec_path.as_os_str().as_bytes())
            .map_err(|_| Error::code(ErrorKind::InvalidArgument))?;

        // Both pipe ends are close-on-exec: a successful exec closes the
        // child's write end and the parent reads EOF.
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| Error::errno_msg(ErrorKind::PipeFailed, e, "pipe"))?;

        match unsafe { fork() } {
            Err(e) => Err(Error::errno_msg(ErrorKind::ForkFailed, e, "fork")),
            Ok(ForkResult::Child) => {
                drop(read_fd);
                Self::exec_child(write_fd, &exec_cstr, &argv)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(write_fd);
                info!(
                    "inferior {}: spawned process {} from {}",
                    self.id,
                    child,
                    exec_path.display()
                );
                self.finish_spawn(child, read_fd)
            }
        }
    }

    /// Child half of `run()`. Puts the child into its own process group so
    /// keyboard signals reach the debugger only, requests self-trace, and
    /// execs. Any failure is written as "<kind> <errno>" to the error pipe.
    fn exec_child(error_pipe: OwnedFd, exec: &CString, argv: &[CString]) -> ! {
        let mut pipe = File::from(error_pipe);

        if setpgid(Pid::from_raw(0), Pid::from_raw(0)).is_err() {
            Self::exit_child(&mut pipe, ErrorKind::SystemError);
        }
        if ptrace::traceme().is_err() {
            Self::exit_child(&mut pipe, ErrorKind::PtraceError);
        }

        let _ = execvp(exec, argv);
        Self::exit_child(&mut pipe, ErrorKind::ExecFailed)
    }

    fn exit_child(pipe: &mut File, kind: ErrorKind) -> ! {
        let errno = Errno::last();
        let _ = write!(pipe, "{} {}", kind.code(), errno as i32);
        let _ = pipe.flush();
        unsafe { libc::_exit(1) }
    }

    /// Parent half of `run()`: waits for the exec verdict on the error
    /// pipe, reaps the post-exec trap, re-arms breakpoints in the fresh
    /// address space and resumes the child.
    fn finish_spawn(&mut self, child: Pid, error_pipe: OwnedFd) -> Result<Event> {
        let mut pipe = File::from(error_pipe);
        let mut buf = Vec::new();
        if pipe.read_to_end(&mut buf).is_err() {
            return Err(Error::msg(ErrorKind::SystemError, "read from pipe"));
        }
        drop(pipe);

        if !buf.is_empty() {
            // The child died before exec; reap it and surface its verdict.
            loop {
                match waitpid(child, None) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
            return Err(Self::child_error(&buf));
        }

        // EOF: exec succeeded. Reap the SIGTRAP that follows TRACEME+exec.
        let status = loop {
            match waitpid(child, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::errno_msg(ErrorKind::WaitpidFailed, e, "waitpid")),
            }
        };

        match status {
            WaitStatus::Exited(_, code) => {
                return Err(Error::msg(
                    ErrorKind::ProcChild,
                    format!("Child process exited with code {}", code),
                ))
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.state = InferiorState::Terminated;
                return Ok(self.report(Event::Terminated { pid: child, signal }));
            }
            WaitStatus::Continued(_) => self.state = InferiorState::Running,
            _ => self.state = InferiorState::Stopped,
        }

        self.pid = Some(child);
        self.attached = false;

        // New address space: all previous patches are gone, so re-install
        // everything the user wants enabled.
        self.breakpoints.clear_physical_flags();
        self.breakpoints.install_all_logical(child)?;

        ptrace::cont(child, None)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceContFailed, e, "ptrace cont"))?;
        self.state = InferiorState::Running;
        self.reconcile(true)
    }

    /// Decodes a "<kind> <errno>" verdict written by the child.
    fn child_error(buf: &[u8]) -> Error {
        let text = String::from_utf8_lossy(buf);
        let mut parts = text.split_whitespace();
        let code = parts.next().and_then(|s| s.parse::<i32>().ok());
        let child_errno = parts
            .next()
            .and_then(|s| s.parse::<i32>().ok())
            .map(Errno::from_raw);

        let (code, errno) = match (code, child_errno) {
            (Some(code), Some(errno)) => (code, errno),
            _ => return Error::msg(ErrorKind::SystemError, "parse child error message"),
        };

        if code == ErrorKind::PtraceError.code() {
            Error::errno_msg(ErrorKind::PtraceError, errno, "ptrace in child")
        } else if code == ErrorKind::ExecFailed.code() {
            Error::errno_msg(ErrorKind::ExecFailed, errno, "exec")
        } else if code == ErrorKind::SystemError.code() {
            Error::errno_msg(ErrorKind::SystemError, errno, "setpgid in child")
        } else {
            Error::msg(
                ErrorKind::ProcChild,
                format!("Child process failed before exec (code {})", code),
            )
        }
    }

    /// Attaches to an existing process and stops it. The inferior adopts
    /// the target's executable path, reloads symbols and re-arms all
    /// logically-enabled breakpoints.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.pid == Some(pid) {
            return Err(Error::msg(
                ErrorKind::ProcAlreadyAttached,
                format!("Process {} is already being traced", pid),
            ));
        }

        if let Err(e) = signal::kill(pid, None) {
            if e == Errno::ESRCH {
                return Err(Error::msg(
                    ErrorKind::ProcNotFound,
                    format!("Process {} does not exist", pid),
                ));
            }
            return Err(Error::errno_msg(
                ErrorKind::SystemError,
                e,
                "Check process existence",
            ));
        }

        self.terminate_or_detach()?;

        if let Err(e) = ptrace::attach(pid) {
            return Err(match e {
                Errno::EPERM => Error::msg(
                    ErrorKind::PtraceAttachFailed,
                    format!("Permission denied to attach to process {}", pid),
                ),
                Errno::ESRCH => Error::msg(
                    ErrorKind::ProcNotFound,
                    format!("Process {} does not exist", pid),
                ),
                e => Error::errno_msg(ErrorKind::PtraceAttachFailed, e, "ptrace attach"),
            });
        }

        // Best effort: a process whose executable was deleted still attaches.
        let exec_path = match paths::real_path_of_pid(pid) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("could not resolve executable of {}: {}", pid, err.message);
                None
            }
        };

        let status = loop {
            match waitpid(pid, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return Err(Error::msg(
                        ErrorKind::ProcNotFound,
                        format!("Process {} disappeared during attach", pid),
                    ))
                }
                Err(e) => return Err(Error::errno_msg(ErrorKind::WaitpidFailed, e, "waitpid")),
            }
        };

        match status {
            WaitStatus::Stopped(_, _) => self.state = InferiorState::Stopped,
            WaitStatus::Continued(_) => self.state = InferiorState::Running,
            WaitStatus::Exited(_, _) => {
                return Err(Error::msg(
                    ErrorKind::ProcExited,
                    format!("Process {} exited during attach", pid),
                ))
            }
            WaitStatus::Signaled(_, _, _) => {
                return Err(Error::msg(
                    ErrorKind::ProcTerminated,
                    format!("Process {} terminated during attach", pid),
                ))
            }
            other => {
                return Err(Error::msg(
                    ErrorKind::Failure,
                    format!("unexpected wait status during attach: {:?}", other),
                ))
            }
        }

        self.pid = Some(pid);
        self.attached = true;
        self.exec_path = exec_path;
        info!("inferior {}: attached to process {}", self.id, pid);

        self.reload_symbols()?;
        self.breakpoints.clear_physical_flags();
        self.breakpoints.install_all_logical(pid)?;
        Ok(())
    }

    /// Releases an attached tracee: restores every patched byte, detaches
    /// and forgets the child. A tracee that already died counts as success.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Err(Error::msg(
                ErrorKind::ProcNotAttached,
                "Process is not being traced",
            ));
        }

        match self.reconcile(false) {
            Ok(Event::Exited { .. }) | Ok(Event::Terminated { .. }) => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind == ErrorKind::ProcNotFound => return Ok(()),
            Err(err) => return Err(err),
        }

        let pid = match self.active_pid() {
            Some(pid) => pid,
            None => {
                self.clear_child();
                return Ok(());
            }
        };

        self.breakpoints.uninstall_all(pid)?;

        if let Err(e) = ptrace::detach(pid, None) {
            if e != Errno::ESRCH {
                return Err(Error::errno_msg(
                    ErrorKind::PtraceDetachFailed,
                    e,
                    "ptrace detach",
                ));
            }
        }

        info!("inferior {}: detached from process {}", self.id, pid);
        self.clear_child();
        Ok(())
    }

    /// Checks that the tracee is stopped, reconciling first so a child that
    /// died behind our back is reported instead.
    fn validate_stopped(&mut self) -> Result<Pid> {
        let event = self.reconcile(false)?;
        if let Event::Exited { .. } | Event::Terminated { .. } = event {
            return Err(event.into_error());
        }

        match self.state {
            InferiorState::Stopped => match self.pid {
                Some(pid) => Ok(pid),
                None => Err(Error::msg(
                    ErrorKind::InvalidState,
                    "Program is not being run",
                )),
            },
            InferiorState::Running => {
                let pid = self.pid.map(|p| p.as_raw()).unwrap_or(0);
                Err(Error::msg(
                    ErrorKind::ProcRunning,
                    format!("Process {} is already running", pid),
                ))
            }
            _ => Err(Error::msg(
                ErrorKind::InvalidState,
                "Process is not in a stopped state",
            )),
        }
    }

    /// If the last stop was one of our traps, steps the tracee over the
    /// original instruction: rewind rip onto the trap address, swap the
    /// original byte back in, single-step, re-install the trap.
    ///
    /// Returns the event of that single step, or `None` when the stop was
    /// not at one of our enabled breakpoints.
    fn resume_past_breakpoint(&mut self) -> Result<Option<Event>> {
        let pid = match self.active_pid() {
            Some(pid) => pid,
            None => return Ok(None),
        };

        let mut regs = ptrace::getregs(pid)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceGetregsFailed, e, "ptrace get regs"))?;

        let index = match self.breakpoints.find(regs.rip.wrapping_sub(1)) {
            Some(index)
                if self
                    .breakpoints
                    .get(index)
                    .map_or(false, |bp| bp.enabled_physical) =>
            {
                index
            }
            _ => return Ok(None),
        };

        // rip points at the byte after the int3 that fired.
        regs.rip -= 1;
        ptrace::setregs(pid, regs)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceSetregsFailed, e, "ptrace set regs"))?;

        self.breakpoints.uninstall(pid, index)?;

        ptrace::step(pid, None)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceStepFailed, e, "ptrace single step"))?;
        self.state = InferiorState::Running;
        let event = self.reconcile(true)?;

        if let Some(pid) = self.active_pid() {
            self.breakpoints.install(pid, index)?;
        }
        Ok(Some(event))
    }

    /// Resumes a stopped tracee and blocks until its next stop or death.
    pub fn cont(&mut self) -> Result<Event> {
        self.validate_stopped()?;

        if let Some(event) = self.resume_past_breakpoint()? {
            // The recovery step may already have reaped the child's death.
            if !self.is_active() {
                return Ok(event);
            }
        }

        let pid = match self.active_pid() {
            Some(pid) => pid,
            None => {
                return Err(Error::msg(
                    ErrorKind::InvalidState,
                    "Program is not being run",
                ))
            }
        };

        ptrace::cont(pid, None)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceContFailed, e, "ptrace cont"))?;
        self.state = InferiorState::Running;
        self.reconcile(true)
    }

    /// Executes exactly one instruction of a stopped tracee. When the
    /// tracee sits on a breakpoint it just hit, the recovery step *is* the
    /// instruction.
    pub fn step_instruction(&mut self) -> Result<Event> {
        let pid = self.validate_stopped()?;

        if let Some(event) = self.resume_past_breakpoint()? {
            return Ok(event);
        }

        ptrace::step(pid, None)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceStepFailed, e, "ptrace single step"))?;
        self.state = InferiorState::Running;
        self.reconcile(true)
    }

    fn validate_live(&mut self, what: &str) -> Result<Pid> {
        let event = self.reconcile(false)?;
        if let Event::Exited { .. } | Event::Terminated { .. } = event {
            return Err(event.into_error());
        }

        match self.active_pid() {
            Some(pid) => Ok(pid),
            None => Err(Error::msg(
                ErrorKind::InvalidState,
                format!("Cannot {}: process is not running or stopped", what),
            )),
        }
    }

    /// Reads the general-purpose register set.
    pub fn get_regs(&mut self) -> Result<user_regs_struct> {
        let pid = self.validate_live("get registers")?;
        ptrace::getregs(pid)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceGetregsFailed, e, "ptrace get regs"))
    }

    /// Writes the general-purpose register set.
    pub fn set_regs(&mut self, regs: &user_regs_struct) -> Result<()> {
        let pid = self.validate_live("set registers")?;
        ptrace::setregs(pid, *regs)
            .map_err(|e| Error::errno_msg(ErrorKind::PtraceSetregsFailed, e, "ptrace set regs"))
    }

    /// Reads one native word (8 bytes) of tracee memory.
    pub fn get_memory(&mut self, addr: u64) -> Result<u64> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => {
                return Err(Error::msg(
                    ErrorKind::InvalidState,
                    "Program is not being run",
                ))
            }
        };

        ptrace::read(pid, addr_ptr(addr)).map(|word| word as u64).map_err(|e| {
            Error::errno_msg(
                ErrorKind::PtracePeekdataFailed,
                e,
                format!("Cannot read address {:#x}", addr),
            )
        })
    }

    /// Reads `len` bytes of tracee memory, word by word.
    pub fn get_memory_range(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(len + 8);
        let mut cursor = addr;
        while bytes.len() < len {
            let word = self.get_memory(cursor)?;
            bytes.extend_from_slice(&word.to_ne_bytes());
            cursor += 8;
        }
        bytes.truncate(len);
        Ok(bytes)
    }

    /// Writes an arbitrary byte sequence into tracee memory: full words
    /// first, then a read-modify-write of the trailing partial word so the
    /// surrounding bytes survive.
    pub fn set_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if addr == 0 {
            return Err(Error::msg(ErrorKind::InvalidArgument, "Invalid address 0x0"));
        }
        let pid = match self.pid {
            Some(pid) => pid,
            None => {
                return Err(Error::msg(
                    ErrorKind::InvalidState,
                    "Program is not being run",
                ))
            }
        };

        let poke_failed = |addr: u64, e: Errno| {
            Error::errno_msg(
                ErrorKind::PtracePokedataFailed,
                e,
                format!("cannot write at {:#x}", addr),
            )
        };

        let mut offset = 0;
        while offset + 8 <= data.len() {
            let mut word = [0u8; 8];
            word.copy_from_slice(&data[offset..offset + 8]);
            let dest = addr + offset as u64;
            ptrace::write(pid, addr_ptr(dest), i64::from_ne_bytes(word))
                .map_err(|e| poke_failed(dest, e))?;
            offset += 8;
        }

        if offset < data.len() {
            let remaining = data.len() - offset;
            let dest = addr + offset as u64;
            let current = ptrace::read(pid, addr_ptr(dest)).map_err(|e| poke_failed(dest, e))? as u64;

            let mut word = [0u8; 8];
            word[..remaining].copy_from_slice(&data[offset..]);
            let incoming = u64::from_ne_bytes(word);

            let mask = (1u64 << (remaining * 8)) - 1;
            let merged = (current & !mask) | (incoming & mask);
            ptrace::write(pid, addr_ptr(dest), merged as i64).map_err(|e| poke_failed(dest, e))?;
        }

        Ok(())
    }

    /// Adds a breakpoint at `addr` and enables it; installs the trap byte
    /// immediately when a tracee is alive.
    pub fn breakpoint_set(&mut self, addr: u64) -> Result<()> {
        let tracee = self.active_pid();
        self.breakpoints.set(tracee, addr)
    }

    /// Removes the breakpoint at `addr`, restoring the original byte first
    /// when the patch is installed.
    pub fn breakpoint_unset(&mut self, addr: u64) -> Result<()> {
        let tracee = self.active_pid();
        self.breakpoints.unset(tracee, addr)
    }

    pub fn breakpoint_enable(&mut self, addr: u64) -> Result<()> {
        let tracee = self.active_pid();
        self.breakpoints.enable(tracee, addr)
    }

    pub fn breakpoint_disable(&mut self, addr: u64) -> Result<()> {
        let tracee = self.active_pid();
        self.breakpoints.disable(tracee, addr)
    }

    /// Resolves `name` (DWARF first, ELF second) and sets a breakpoint at
    /// the resulting address.
    pub fn set_breakpoint_at_function(&mut self, name: &str) -> Result<()> {
        let addr = self.resolve_symbol(name)?;
        self.breakpoint_set(addr)
    }

    /// Resolves a function name to an address through the symbol tables.
    pub fn resolve_symbol(&self, name: &str) -> Result<u64> {
        symbols::resolve(&self.dwarf_symbols, &self.elf_symbols, name)
    }

    fn require_exec_path(&self) -> Result<&Path> {
        self.exec_path.as_deref().ok_or_else(|| {
            Error::msg(ErrorKind::FileNotFound, "No executable path specified")
        })
    }

    /// Disassembles [start, end) from the on-disk image of the executable.
    pub fn disassemble_range(&self, start: u64, end: u64) -> Result<Vec<Instruction>> {
        let path = self.require_exec_path()?;
        disasm::disassemble_file(path, start, end)
    }

    /// Disassembles a whole function, located by its SYMTAB entry.
    pub fn disassemble_function(&self, name: &str) -> Result<Vec<Instruction>> {
        let path = self.require_exec_path()?;
        let (start, end) = disasm::function_range(path, name)?;
        disasm::disassemble_file(path, start, end)
    }

    /// The tracee's auxiliary vector, parsed.
    pub fn auxv(&self) -> Result<Vec<AuxvEntry>> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => {
                return Err(Error::msg(
                    ErrorKind::InvalidState,
                    "Program is not being run",
                ))
            }
        };
        Ok(auxv::parse_auxv(&auxv::read_auxv(pid)?))
    }
}

impl Drop for Inferior {
    fn drop(&mut self) {
        if let Err(err) = self.terminate_or_detach() {
            warn!(
                "inferior {}: failed to release child on destroy: {}",
                self.id, err.message
            );
        }
        LIVE_INFERIORS.fetch_sub(1, Ordering::SeqCst);
    }
}

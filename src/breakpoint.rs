//! Breakpoint bookkeeping and byte patching.
//!
//! A breakpoint is *logical* when the user wants it (survives the child
//! dying or being replaced) and *physical* when the `int3` patch is actually
//! installed in a live tracee. Patching is word-granular: read the word at
//! the address, rewrite only its low byte, write the word back.

use crate::errors::{Error, ErrorKind, Result};
use log::debug;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Fixed capacity of the table.
pub const MAX_BREAKPOINTS: usize = 256;

/// The x86 `int3` opcode.
const TRAP_BYTE: i64 = 0xCC;

#[derive(Copy, Clone, Debug)]
pub struct Breakpoint {
    /// Virtual address in the tracee.
    pub addr: u64,
    /// The byte the trap replaced; valid only while `enabled_physical`.
    pub orig_byte: u8,
    /// User intent; survives process death and replacement.
    pub enabled_logical: bool,
    /// True iff the trap byte is currently installed in a live tracee.
    pub enabled_physical: bool,
}

/// The set of breakpoints owned by one inferior. Insertion-ordered; removal
/// swaps the last record into the freed slot. Addresses are unique.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: Vec<Breakpoint>,
}

fn addr_ptr(addr: u64) -> ptrace::AddressType {
    addr as usize as ptrace::AddressType
}

fn peek(pid: Pid, addr: u64) -> Result<i64> {
    ptrace::read(pid, addr_ptr(addr))
        .map_err(|e| Error::errno_msg(ErrorKind::PtracePeektextFailed, e, "ptrace peek text"))
}

fn poke(pid: Pid, addr: u64, word: i64) -> Result<()> {
    ptrace::write(pid, addr_ptr(addr), word)
        .map_err(|e| Error::errno_msg(ErrorKind::PtracePoketextFailed, e, "ptrace poke text"))
}

impl BreakpointTable {
    /// Index of the record at `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<usize> {
        self.breakpoints.iter().position(|bp| bp.addr == addr)
    }

    pub fn get(&self, index: usize) -> Option<&Breakpoint> {
        self.breakpoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Appends a record for `addr` and enables it. When `tracee` names a live
    /// stopped process the trap byte is installed immediately.
    pub fn set(&mut self, tracee: Option<Pid>, addr: u64) -> Result<()> {
        if self.breakpoints.len() == MAX_BREAKPOINTS {
            return Err(Error::code(ErrorKind::BreakpointLimitReached));
        }
        if self.find(addr).is_some() {
            return Err(Error::code(ErrorKind::BreakpointAlreadyExists));
        }

        self.breakpoints.push(Breakpoint {
            addr,
            orig_byte: 0,
            enabled_logical: true,
            enabled_physical: false,
        });

        if let Some(pid) = tracee {
            self.install(pid, self.breakpoints.len() - 1)?;
        }
        Ok(())
    }

    /// Disables and removes the record at `addr` (swap-with-last).
    pub fn unset(&mut self, tracee: Option<Pid>, addr: u64) -> Result<()> {
        let index = self
            .find(addr)
            .ok_or_else(|| Error::code(ErrorKind::BreakpointNotFound))?;

        self.breakpoints[index].enabled_logical = false;
        if let Some(pid) = tracee {
            self.uninstall(pid, index)?;
        }
        self.breakpoints.swap_remove(index);
        Ok(())
    }

    /// Marks the record at `addr` enabled-logical and installs the patch in a
    /// live tracee.
    pub fn enable(&mut self, tracee: Option<Pid>, addr: u64) -> Result<()> {
        let index = self
            .find(addr)
            .ok_or_else(|| Error::code(ErrorKind::BreakpointNotFound))?;

        self.breakpoints[index].enabled_logical = true;
        match tracee {
            Some(pid) => self.install(pid, index),
            None => Ok(()),
        }
    }

    /// Marks the record at `addr` disabled-logical and restores the original
    /// byte in a live tracee.
    pub fn disable(&mut self, tracee: Option<Pid>, addr: u64) -> Result<()> {
        let index = self
            .find(addr)
            .ok_or_else(|| Error::code(ErrorKind::BreakpointNotFound))?;

        self.breakpoints[index].enabled_logical = false;
        match tracee {
            Some(pid) => self.uninstall(pid, index),
            None => Ok(()),
        }
    }

    /// Installs the trap byte for the record at `index`. Idempotent through
    /// `enabled_physical`.
    pub(crate) fn install(&mut self, pid: Pid, index: usize) -> Result<()> {
        let bp = &mut self.breakpoints[index];
        if bp.enabled_physical {
            return Ok(());
        }

        let word = peek(pid, bp.addr)?;
        poke(pid, bp.addr, (word & !0xFF) | TRAP_BYTE)?;
        bp.orig_byte = (word & 0xFF) as u8;
        bp.enabled_physical = true;
        debug!("installed breakpoint at {:#x} in pid {}", bp.addr, pid);
        Ok(())
    }

    /// Restores the original byte for the record at `index`. Idempotent.
    pub(crate) fn uninstall(&mut self, pid: Pid, index: usize) -> Result<()> {
        let bp = &mut self.breakpoints[index];
        if !bp.enabled_physical {
            return Ok(());
        }

        let word = peek(pid, bp.addr)?;
        poke(pid, bp.addr, (word & !0xFF) | i64::from(bp.orig_byte))?;
        bp.enabled_physical = false;
        debug!("removed breakpoint at {:#x} in pid {}", bp.addr, pid);
        Ok(())
    }

    /// Forgets all physical state. Used right after spawn/attach: the new
    /// address space carries none of our patches.
    pub(crate) fn clear_physical_flags(&mut self) {
        for bp in &mut self.breakpoints {
            bp.enabled_physical = false;
        }
    }

    /// Installs every record the user wants enabled.
    pub(crate) fn install_all_logical(&mut self, pid: Pid) -> Result<()> {
        for index in 0..self.breakpoints.len() {
            if self.breakpoints[index].enabled_logical {
                self.install(pid, index)?;
            }
        }
        Ok(())
    }

    /// Restores every installed patch.
    pub(crate) fn uninstall_all(&mut self, pid: Pid) -> Result<()> {
        for index in 0..self.breakpoints.len() {
            self.uninstall(pid, index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_records_logical_intent() {
        let mut table = BreakpointTable::default();
        table.set(None, 0x400500).unwrap();
        assert_eq!(table.len(), 1);
        let bp = table.get(0).unwrap();
        assert!(bp.enabled_logical);
        assert!(!bp.enabled_physical);
    }

    #[test]
    fn duplicate_address_rejected() {
        let mut table = BreakpointTable::default();
        table.set(None, 0x400500).unwrap();
        let err = table.set(None, 0x400500).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BreakpointAlreadyExists);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn capacity_limit() {
        let mut table = BreakpointTable::default();
        for i in 0..MAX_BREAKPOINTS {
            table.set(None, 0x400000 + i as u64).unwrap();
        }
        let err = table.set(None, 0x500000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BreakpointLimitReached);
        assert_eq!(table.len(), MAX_BREAKPOINTS);
    }

    #[test]
    fn unset_swaps_last_into_slot() {
        let mut table = BreakpointTable::default();
        table.set(None, 0x1000).unwrap();
        table.set(None, 0x2000).unwrap();
        table.set(None, 0x3000).unwrap();

        table.unset(None, 0x1000).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().addr, 0x3000);
        assert_eq!(table.get(1).unwrap().addr, 0x2000);

        let err = table.unset(None, 0x1000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BreakpointNotFound);
    }

    #[test]
    fn enable_disable_toggle_logical_flag() {
        let mut table = BreakpointTable::default();
        table.set(None, 0x1000).unwrap();

        table.disable(None, 0x1000).unwrap();
        assert!(!table.get(0).unwrap().enabled_logical);
        // Idempotent both ways.
        table.disable(None, 0x1000).unwrap();
        assert!(!table.get(0).unwrap().enabled_logical);
        table.enable(None, 0x1000).unwrap();
        table.enable(None, 0x1000).unwrap();
        assert!(table.get(0).unwrap().enabled_logical);

        let err = table.enable(None, 0x9999).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BreakpointNotFound);
    }

    #[test]
    fn clear_physical_flags_preserves_logical() {
        let mut table = BreakpointTable::default();
        table.set(None, 0x1000).unwrap();
        table.set(None, 0x2000).unwrap();
        table.disable(None, 0x2000).unwrap();

        table.clear_physical_flags();
        assert!(table.iter().all(|bp| !bp.enabled_physical));
        assert!(table.get(0).unwrap().enabled_logical);
        assert!(!table.get(1).unwrap().enabled_logical);
    }
}

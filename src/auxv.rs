//! Auxiliary-vector primitives.
//!
//! The kernel passes every process a vector of (type, value) pairs at
//! startup; `/proc/<pid>/auxv` exposes the raw bytes. The core only reads
//! and parses; pretty-printing belongs to the command layer.

use crate::errors::{Error, ErrorKind, Result};
use nix::unistd::Pid;
use std::fs;
use std::io;

/// One auxiliary-vector entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AuxvEntry {
    pub a_type: u64,
    pub value: u64,
}

/// Descriptive metadata for a known auxv type. `decimal` marks entries whose
/// value reads better unformatted (sizes, ids, counts) than as an address.
pub struct AuxvTypeInfo {
    pub a_type: u64,
    pub name: &'static str,
    pub desc: &'static str,
    pub decimal: bool,
}

// Not yet exported from libc's AT_* set.
const AT_RSEQ_FEATURE_SIZE: u64 = 27;
const AT_RSEQ_ALIGN: u64 = 28;

pub static AUXV_TYPES: &[AuxvTypeInfo] = &[
    AuxvTypeInfo { a_type: libc::AT_IGNORE, name: "AT_IGNORE", desc: "Entry should be ignored", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_EXECFD, name: "AT_EXECFD", desc: "File descriptor of program", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_PHDR, name: "AT_PHDR", desc: "Program headers for program", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_PHENT, name: "AT_PHENT", desc: "Size of program header entry", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_PHNUM, name: "AT_PHNUM", desc: "Number of program headers", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_PAGESZ, name: "AT_PAGESZ", desc: "System page size", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_BASE, name: "AT_BASE", desc: "Base address of interpreter", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_FLAGS, name: "AT_FLAGS", desc: "Flags", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_ENTRY, name: "AT_ENTRY", desc: "Entry point of program", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_NOTELF, name: "AT_NOTELF", desc: "Program is not ELF", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_UID, name: "AT_UID", desc: "Real uid", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_EUID, name: "AT_EUID", desc: "Effective uid", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_GID, name: "AT_GID", desc: "Real gid", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_EGID, name: "AT_EGID", desc: "Effective gid", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_PLATFORM, name: "AT_PLATFORM", desc: "String identifying platform", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_HWCAP, name: "AT_HWCAP", desc: "Machine-dependent hints about processor capabilities", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_CLKTCK, name: "AT_CLKTCK", desc: "Frequency of times()", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_SECURE, name: "AT_SECURE", desc: "Secure mode boolean", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_BASE_PLATFORM, name: "AT_BASE_PLATFORM", desc: "String identifying real platforms", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_RANDOM, name: "AT_RANDOM", desc: "Address of 16 random bytes", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_HWCAP2, name: "AT_HWCAP2", desc: "Extension of AT_HWCAP", decimal: false },
    AuxvTypeInfo { a_type: AT_RSEQ_FEATURE_SIZE, name: "AT_RSEQ_FEATURE_SIZE", desc: "rseq supported feature size", decimal: true },
    AuxvTypeInfo { a_type: AT_RSEQ_ALIGN, name: "AT_RSEQ_ALIGN", desc: "rseq allocation alignment", decimal: true },
    AuxvTypeInfo { a_type: libc::AT_EXECFN, name: "AT_EXECFN", desc: "Filename of executable", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_SYSINFO_EHDR, name: "AT_SYSINFO_EHDR", desc: "Address of the vDSO", decimal: false },
    AuxvTypeInfo { a_type: libc::AT_MINSIGSTKSZ, name: "AT_MINSIGSTKSZ", desc: "Minimal stack size for signal delivery", decimal: true },
];

/// Looks up the metadata for a known auxv type.
pub fn auxv_type_info(a_type: u64) -> Option<&'static AuxvTypeInfo> {
    AUXV_TYPES.iter().find(|info| info.a_type == a_type)
}

/// Reads the whole auxiliary vector of `pid` from procfs.
pub fn read_auxv(pid: Pid) -> Result<Vec<u8>> {
    let path = format!("/proc/{}/auxv", pid);
    fs::read(&path).map_err(|err| {
        let errno = err
            .raw_os_error()
            .map(nix::errno::Errno::from_raw)
            .unwrap_or(nix::errno::Errno::EIO);
        if err.kind() == io::ErrorKind::NotFound {
            Error::msg(ErrorKind::ProcNotFound, format!("Process {} does not exist", pid))
        } else {
            Error::errno_msg(ErrorKind::SystemError, errno, format!("read {}", path))
        }
    })
}

/// Parses raw auxv bytes into entries, stopping at the AT_NULL terminator
/// (which is not included in the result).
pub fn parse_auxv(data: &[u8]) -> Vec<AuxvEntry> {
    let mut entries = Vec::new();
    for pair in data.chunks_exact(16) {
        let mut word = [0u8; 8];
        word.copy_from_slice(&pair[..8]);
        let a_type = u64::from_ne_bytes(word);
        word.copy_from_slice(&pair[8..]);
        let value = u64::from_ne_bytes(word);

        if a_type == libc::AT_NULL {
            break;
        }
        entries.push(AuxvEntry { a_type, value });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(u64, u64)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (a_type, value) in pairs {
            bytes.extend_from_slice(&a_type.to_ne_bytes());
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        bytes
    }

    #[test]
    fn parse_stops_at_terminator() {
        let data = raw(&[
            (libc::AT_PAGESZ, 4096),
            (libc::AT_ENTRY, 0x401000),
            (libc::AT_NULL, 0),
            (libc::AT_UID, 1000), // past the terminator, must not be seen
        ]);
        let entries = parse_auxv(&data);
        assert_eq!(
            entries,
            vec![
                AuxvEntry { a_type: libc::AT_PAGESZ, value: 4096 },
                AuxvEntry { a_type: libc::AT_ENTRY, value: 0x401000 },
            ]
        );
    }

    #[test]
    fn parse_tolerates_truncated_tail() {
        let mut data = raw(&[(libc::AT_PAGESZ, 4096)]);
        data.extend_from_slice(&[0u8; 5]); // partial pair
        assert_eq!(parse_auxv(&data).len(), 1);
        assert!(parse_auxv(&[]).is_empty());
    }

    #[test]
    fn read_own_auxv() {
        let data = read_auxv(Pid::this()).unwrap();
        let entries = parse_auxv(&data);
        assert!(entries.iter().any(|e| e.a_type == libc::AT_PAGESZ));
    }

    #[test]
    fn type_info_lookup() {
        assert_eq!(auxv_type_info(libc::AT_PAGESZ).unwrap().name, "AT_PAGESZ");
        let rseq = auxv_type_info(AT_RSEQ_ALIGN).unwrap();
        assert_eq!(rseq.name, "AT_RSEQ_ALIGN");
        assert!(rseq.decimal);
        assert!(auxv_type_info(libc::AT_MINSIGSTKSZ).unwrap().decimal);
        assert!(auxv_type_info(0xdead_beef).is_none());
    }
}

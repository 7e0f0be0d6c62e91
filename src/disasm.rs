//! Disassembly of address ranges from the on-disk ELF image.
//!
//! Bytes are read from the executable file, not the live process, so the
//! listing shows the program's real instructions rather than any trap bytes
//! the debugger has patched in.

use crate::errors::{Error, ErrorKind, Result};
use capstone::arch::x86::ArchMode;
use capstone::arch::BuildsCapstone;
use capstone::Capstone;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::sym::STT_FUNC;
use goblin::elf::Elf;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// One decoded instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Runtime virtual address.
    pub addr: u64,
    /// Hex dump of the encoded bytes, e.g. "48 89 E5".
    pub opcodes: String,
    /// Decoded text, e.g. "mov rbp, rsp".
    pub text: String,
}

/// Maps a virtual address to its file offset through the PT_LOAD program
/// headers. Returns (offset, bytes remaining in the segment's file image).
fn file_offset_of_vaddr(elf: &Elf, vaddr: u64) -> Option<(u64, u64)> {
    for phdr in &elf.program_headers {
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if vaddr >= phdr.p_vaddr && vaddr < phdr.p_vaddr + phdr.p_memsz {
            let within = vaddr - phdr.p_vaddr;
            if within >= phdr.p_filesz {
                return None; // address lives in the zero-filled tail
            }
            return Some((phdr.p_offset + within, phdr.p_filesz - within));
        }
    }
    None
}

/// Decodes `buffer` as long-mode x86-64 starting at `addr`. Decoding stops
/// at the first undecodable byte.
fn decode(buffer: &[u8], addr: u64) -> Result<Vec<Instruction>> {
    let cs = Capstone::new()
        .x86()
        .mode(ArchMode::Mode64)
        .build()
        .map_err(|e| Error::msg(ErrorKind::Failure, format!("capstone init: {}", e)))?;
    let insns = cs
        .disasm_all(buffer, addr)
        .map_err(|e| Error::msg(ErrorKind::Failure, format!("disassemble: {}", e)))?;

    let mut out = Vec::with_capacity(insns.len());
    for insn in insns.iter() {
        let mut opcodes = String::with_capacity(insn.bytes().len() * 3);
        for byte in insn.bytes() {
            let _ = write!(opcodes, "{:02X} ", byte);
        }
        opcodes.pop();

        let text = match (insn.mnemonic(), insn.op_str()) {
            (Some(mnemonic), Some(ops)) if !ops.is_empty() => format!("{} {}", mnemonic, ops),
            (Some(mnemonic), _) => mnemonic.to_string(),
            _ => String::new(),
        };

        out.push(Instruction {
            addr: insn.address(),
            opcodes,
            text,
        });
    }
    Ok(out)
}

/// Disassembles [start, end) of the executable at `path`. The range is
/// clamped to the containing loadable segment's file image.
pub fn disassemble_file(path: &Path, start: u64, end: u64) -> Result<Vec<Instruction>> {
    if start >= end {
        return Err(Error::msg(
            ErrorKind::InvalidArgument,
            format!("empty address range {:#x}..{:#x}", start, end),
        ));
    }

    let buffer = fs::read(path)
        .map_err(|_| Error::msg(ErrorKind::ElfFailed, format!("open {}", path.display())))?;
    let elf = Elf::parse(&buffer).map_err(|_| Error::code(ErrorKind::ElfFailed))?;

    let (offset, remaining) = file_offset_of_vaddr(&elf, start).ok_or_else(|| {
        Error::msg(
            ErrorKind::InvalidArgument,
            format!("address {:#x} not in any loadable segment", start),
        )
    })?;

    let size = (end - start).min(remaining) as usize;
    let offset = offset as usize;
    let code = buffer.get(offset..offset + size).ok_or_else(|| {
        Error::msg(
            ErrorKind::ElfFailed,
            format!("segment at {:#x} extends past end of file", start),
        )
    })?;

    decode(code, start)
}

/// Resolves the [start, end) range of a function through the SYMTAB entries
/// of type STT_FUNC.
pub fn function_range(path: &Path, name: &str) -> Result<(u64, u64)> {
    let buffer = fs::read(path)
        .map_err(|_| Error::msg(ErrorKind::ElfFailed, format!("open {}", path.display())))?;
    let elf = Elf::parse(&buffer).map_err(|_| Error::code(ErrorKind::ElfFailed))?;

    for sym in elf.syms.iter() {
        if sym.st_type() != STT_FUNC {
            continue;
        }
        if elf.strtab.get_at(sym.st_name) == Some(name) {
            return Ok((sym.st_value, sym.st_value + sym.st_size));
        }
    }

    Err(Error::msg(
        ErrorKind::SymbolNotFound,
        format!("Function '{}' not found in {}", name, path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn decode_known_bytes() {
        // push rbp; mov rbp, rsp; ret
        let code = [0x55, 0x48, 0x89, 0xE5, 0xC3];
        let insns = decode(&code, 0x1000).unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].addr, 0x1000);
        assert_eq!(insns[0].opcodes, "55");
        assert_eq!(insns[0].text, "push rbp");
        assert_eq!(insns[1].addr, 0x1001);
        assert_eq!(insns[1].opcodes, "48 89 E5");
        assert_eq!(insns[2].text, "ret");
    }

    #[test]
    fn decode_stops_at_first_failure() {
        // ret followed by a lone 0xFF garbage tail that cannot decode alone
        let code = [0xC3, 0xFF];
        let insns = decode(&code, 0).unwrap();
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].text, "ret");
    }

    #[test]
    fn empty_range_is_invalid() {
        let exe = env::current_exe().unwrap();
        let err = disassemble_file(&exe, 0x2000, 0x2000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn disassemble_own_main() {
        let exe = env::current_exe().unwrap();
        let (start, end) = function_range(&exe, "main").unwrap();
        assert!(end > start);
        let insns = disassemble_file(&exe, start, end).unwrap();
        assert!(!insns.is_empty());
        assert_eq!(insns[0].addr, start);
        assert!(insns.iter().all(|i| i.addr >= start && i.addr < end));
    }

    #[test]
    fn unknown_function_not_found() {
        let exe = env::current_exe().unwrap();
        let err = function_range(&exe, "kestrel_no_such_function").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SymbolNotFound);
    }
}

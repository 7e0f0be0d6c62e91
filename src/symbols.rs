//! Symbol resolution from ELF symbol tables and DWARF debug info.
//!
//! Each inferior owns two independently sorted name→address tables: one
//! built from the executable's SYMTAB/DYNSYM sections (code symbols only),
//! one from DWARF subprogram DIEs. Lookup consults DWARF first and falls
//! back to ELF, so debug info wins when both name the same function.

use crate::errors::{Error, ErrorKind, Result};
use gimli::{AttributeValue, EndianSlice, RunTimeEndian};
use goblin::elf::section_header::SHF_EXECINSTR;
use goblin::elf::Elf;
use log::warn;
use std::fs;
use std::path::Path;

/// One name→address pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub addr: u64,
}

/// A name-sorted symbol array with binary-search lookup.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn push(&mut self, name: impl Into<String>, addr: u64) {
        self.symbols.push(Symbol {
            name: name.into(),
            addr,
        });
    }

    /// Sorts by name ascending, byte-wise. Must be called before [`lookup`].
    ///
    /// [`lookup`]: SymbolTable::lookup
    pub fn sort(&mut self) {
        self.symbols
            .sort_unstable_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    }

    /// Binary search by name. With duplicate names any matching entry may be
    /// returned.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.symbols
            .binary_search_by(|sym| sym.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|idx| self.symbols[idx].addr)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}

/// Resolves `name` through both tables: DWARF first, ELF as fallback.
pub fn resolve(dwarf: &SymbolTable, elf: &SymbolTable, name: &str) -> Result<u64> {
    dwarf
        .lookup(name)
        .or_else(|| elf.lookup(name))
        .ok_or_else(|| Error::msg(ErrorKind::SymbolNotFound, format!("{:.256} not found", name)))
}

/// Loads (name, st_value) pairs from the SYMTAB and DYNSYM sections of the
/// executable at `path`, keeping only symbols whose containing section is
/// executable. The result is sorted.
pub fn load_elf(path: &Path) -> Result<SymbolTable> {
    let buffer = fs::read(path)
        .map_err(|_| Error::msg(ErrorKind::ElfFailed, format!("open {}", path.display())))?;
    let elf = Elf::parse(&buffer).map_err(|_| Error::code(ErrorKind::ElfFailed))?;

    let mut table = SymbolTable::default();
    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (syms, strtab) in &tables {
        for sym in syms.iter() {
            let shdr = match elf.section_headers.get(sym.st_shndx) {
                Some(shdr) => shdr,
                None => continue,
            };
            if shdr.sh_flags & u64::from(SHF_EXECINSTR) == 0 {
                continue;
            }
            match strtab.get_at(sym.st_name) {
                Some(name) if !name.is_empty() => table.push(name, sym.st_value),
                _ => continue,
            }
        }
    }

    table.sort();
    Ok(table)
}

/// Loads (name, low_pc) pairs from every `DW_TAG_subprogram` DIE in the
/// executable's DWARF info. An executable without debug info reports
/// DWARF_NOT_FOUND; a parse error mid-walk keeps whatever was collected.
/// The result is sorted.
pub fn load_dwarf(path: &Path) -> Result<SymbolTable> {
    let buffer = fs::read(path)
        .map_err(|_| Error::msg(ErrorKind::ElfFailed, format!("open {}", path.display())))?;
    let elf = Elf::parse(&buffer).map_err(|_| Error::code(ErrorKind::ElfFailed))?;

    if section_bytes(&elf, &buffer, ".debug_info").is_none() {
        return Err(Error::code(ErrorKind::DwarfNotFound));
    }

    let endian = if elf.little_endian {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let dwarf = gimli::Dwarf::load(|section| {
        let data = section_bytes(&elf, &buffer, section.name()).unwrap_or(&[]);
        Ok::<_, gimli::Error>(EndianSlice::new(data, endian))
    })
    .map_err(|_| Error::code(ErrorKind::DwarfNotFound))?;

    let mut table = SymbolTable::default();
    if let Err(err) = walk_subprograms(&dwarf, &mut table) {
        warn!("DWARF walk of {} stopped early: {}", path.display(), err);
    }

    table.sort();
    Ok(table)
}

fn section_bytes<'a>(elf: &Elf, buffer: &'a [u8], name: &str) -> Option<&'a [u8]> {
    for shdr in &elf.section_headers {
        if elf.shdr_strtab.get_at(shdr.sh_name) == Some(name) {
            let start = shdr.sh_offset as usize;
            let end = start.checked_add(shdr.sh_size as usize)?;
            return buffer.get(start..end);
        }
    }
    None
}

fn walk_subprograms(
    dwarf: &gimli::Dwarf<EndianSlice<RunTimeEndian>>,
    table: &mut SymbolTable,
) -> std::result::Result<(), gimli::Error> {
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_subprogram {
                continue;
            }
            let low_pc = match entry.attr_value(gimli::DW_AT_low_pc)? {
                Some(AttributeValue::Addr(addr)) => addr,
                Some(value) => match dwarf.attr_address(&unit, value)? {
                    Some(addr) => addr,
                    None => continue,
                },
                None => continue,
            };
            let name = match entry.attr_value(gimli::DW_AT_name)? {
                Some(value) => {
                    String::from_utf8_lossy(dwarf.attr_string(&unit, value)?.slice()).into_owned()
                }
                None => continue,
            };
            table.push(name, low_pc);
        }
    }
    Ok(())
}

/// Rebuilds both tables for the executable at `path`. Missing DWARF info is
/// not an error and yields an empty DWARF table.
pub fn load_tables(path: &Path) -> Result<(SymbolTable, SymbolTable)> {
    let dwarf = match load_dwarf(path) {
        Ok(table) => table,
        Err(err) if err.kind == ErrorKind::DwarfNotFound => SymbolTable::default(),
        Err(err) => return Err(err),
    };
    let elf = load_elf(path)?;
    Ok((elf, dwarf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn table(pairs: &[(&str, u64)]) -> SymbolTable {
        let mut t = SymbolTable::default();
        for (name, addr) in pairs {
            t.push(*name, *addr);
        }
        t.sort();
        t
    }

    #[test]
    fn lookup_after_sort() {
        let t = table(&[("zeta", 3), ("alpha", 1), ("mid", 2)]);
        assert_eq!(t.lookup("alpha"), Some(1));
        assert_eq!(t.lookup("mid"), Some(2));
        assert_eq!(t.lookup("zeta"), Some(3));
        assert_eq!(t.lookup("missing"), None);
    }

    #[test]
    fn resolve_prefers_dwarf() {
        let dwarf = table(&[("foo", 0x1234)]);
        let elf = table(&[("foo", 0x5678), ("bar", 0x9abc)]);
        assert_eq!(resolve(&dwarf, &elf, "foo").unwrap(), 0x1234);
        assert_eq!(resolve(&dwarf, &elf, "bar").unwrap(), 0x9abc);
        let err = resolve(&dwarf, &elf, "baz").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SymbolNotFound);
    }

    #[test]
    fn load_elf_of_own_binary() {
        let exe = env::current_exe().unwrap();
        let t = load_elf(&exe).unwrap();
        assert!(!t.is_empty());
        // Sorted ascending by name bytes.
        let names: Vec<&[u8]> = t.iter().map(|s| s.name.as_bytes()).collect();
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
        // The C entry point is a code symbol in any unstripped executable.
        assert!(t.lookup("main").is_some());
    }

    #[test]
    fn load_tables_is_deterministic() {
        let exe = env::current_exe().unwrap();
        let (elf_a, dwarf_a) = load_tables(&exe).unwrap();
        let (elf_b, dwarf_b) = load_tables(&exe).unwrap();
        assert_eq!(elf_a.len(), elf_b.len());
        assert_eq!(dwarf_a.len(), dwarf_b.len());
        assert!(elf_a
            .iter()
            .zip(elf_b.iter())
            .all(|(a, b)| a.name == b.name && a.addr == b.addr));
    }

    #[test]
    fn load_elf_rejects_non_elf() {
        let err = load_elf(Path::new("/proc/self/stat")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ElfFailed);
    }
}

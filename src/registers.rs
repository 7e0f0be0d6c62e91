//! Metadata for the x86-64 general-purpose register set.
//!
//! The kernel hands us registers as one `user_regs_struct`; user commands
//! name registers by their lower-case mnemonics. This module provides the
//! fixed table mapping each mnemonic to its byte offset and width within
//! that layout, plus accessors that read or write a single register through
//! the table.

use libc::user_regs_struct;
use memoffset::offset_of;
use std::ptr;

/// Static description of one general-purpose register.
#[derive(Copy, Clone, Debug)]
pub struct RegisterInfo {
    /// Lower-case mnemonic, e.g. "rax".
    pub name: &'static str,
    /// DWARF register number, or -1 where the standard assigns none.
    pub dwarf_id: i32,
    /// Width in bytes.
    pub size: usize,
    /// Byte offset within `user_regs_struct`.
    pub offset: usize,
}

macro_rules! gpr64 {
    ($name:ident, $dwarf_id:expr) => {
        RegisterInfo {
            name: stringify!($name),
            dwarf_id: $dwarf_id,
            size: 8,
            offset: offset_of!(user_regs_struct, $name),
        }
    };
}

lazy_static! {
    /// All registers exposed to the user, in display order.
    pub static ref REGISTERS: Vec<RegisterInfo> = vec![
        gpr64!(rax, 0),
        gpr64!(rdx, 1),
        gpr64!(rcx, 2),
        gpr64!(rbx, 3),
        gpr64!(rsi, 4),
        gpr64!(rdi, 5),
        gpr64!(rbp, 6),
        gpr64!(rsp, 7),
        gpr64!(r8, 8),
        gpr64!(r9, 9),
        gpr64!(r10, 10),
        gpr64!(r11, 11),
        gpr64!(r12, 12),
        gpr64!(r13, 13),
        gpr64!(r14, 14),
        gpr64!(r15, 15),
        gpr64!(rip, 16),
        gpr64!(eflags, 49),
        gpr64!(cs, 51),
        gpr64!(fs, 54),
        gpr64!(gs, 55),
        gpr64!(ss, 52),
        gpr64!(ds, 53),
        gpr64!(es, 50),
        gpr64!(orig_rax, -1),
    ];
}

/// Looks up a register by its lower-case mnemonic.
pub fn register_by_name(name: &str) -> Option<&'static RegisterInfo> {
    REGISTERS.iter().find(|reg| reg.name == name)
}

/// Reads one register out of a captured register set.
pub fn read_register(regs: &user_regs_struct, reg: &RegisterInfo) -> u64 {
    debug_assert_eq!(reg.size, 8);
    let base = regs as *const user_regs_struct as *const u8;
    // Offsets come from offset_of! over the same struct, so the read stays
    // in bounds and lands on a field boundary.
    unsafe { ptr::read(base.add(reg.offset) as *const u64) }
}

/// Writes one register into a captured register set.
pub fn write_register(regs: &mut user_regs_struct, reg: &RegisterInfo, value: u64) {
    debug_assert_eq!(reg.size, 8);
    let base = regs as *mut user_regs_struct as *mut u8;
    unsafe { ptr::write(base.add(reg.offset) as *mut u64, value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::mem;

    fn zeroed_regs() -> user_regs_struct {
        unsafe { mem::zeroed() }
    }

    #[test]
    fn table_names_are_unique_and_in_bounds() {
        let mut names = HashSet::new();
        let mut offsets = HashSet::new();
        for reg in REGISTERS.iter() {
            assert!(names.insert(reg.name), "duplicate register {}", reg.name);
            assert!(offsets.insert(reg.offset));
            assert!(reg.offset + reg.size <= mem::size_of::<user_regs_struct>());
        }
    }

    #[test]
    fn lookup_by_name() {
        assert!(register_by_name("rip").is_some());
        assert!(register_by_name("orig_rax").is_some());
        assert!(register_by_name("xmm0").is_none());
    }

    #[test]
    fn read_write_round_trip() {
        let mut regs = zeroed_regs();
        let rip = register_by_name("rip").unwrap();
        write_register(&mut regs, rip, 0x4010a0);
        assert_eq!(regs.rip, 0x4010a0);
        assert_eq!(read_register(&regs, rip), 0x4010a0);

        let rsp = register_by_name("rsp").unwrap();
        write_register(&mut regs, rsp, u64::MAX);
        assert_eq!(regs.rsp, u64::MAX);
        // Neighbouring fields stay untouched.
        assert_eq!(regs.rip, 0x4010a0);
    }
}

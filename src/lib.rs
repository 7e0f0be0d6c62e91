//! kestrel: a ptrace-based debugger for x86-64 Linux ELF executables.
//!
//! The library is organized around one central type, [`Inferior`]: the
//! debugger's handle to a single traced child process. Everything else is a
//! service the inferior consumes: the breakpoint table, the symbol resolver,
//! the disassembler, and the thread-local error channel.

#[macro_use]
extern crate lazy_static;

pub mod auxv;
pub mod breakpoint;
pub mod commands;
pub mod disasm;
pub mod errors;
pub mod inferior;
pub mod paths;
pub mod registers;
pub mod symbols;

pub use crate::breakpoint::Breakpoint;
pub use crate::errors::{last_error, Error, ErrorKind, Result};
pub use crate::inferior::{Event, Inferior, InferiorState};

//! The user-facing command layer: a thin line-oriented dispatcher over the
//! library. Parsing here is deliberately simple; all the real work happens
//! in the engine, and any failure is reported by the caller through
//! [`crate::last_error`].

pub mod options;

use crate::auxv::auxv_type_info;
use crate::disasm::Instruction;
use crate::errors::{Error, ErrorKind, Result};
use crate::inferior::{Event, Inferior};
use crate::registers::{read_register, register_by_name, write_register, REGISTERS};
use nix::unistd::Pid;

/// What the REPL should do after a command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Handled,
    Quit,
}

fn parse_u64(text: &str) -> Result<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed.map_err(|_| Error::msg(ErrorKind::InvalidArgument, format!("Invalid number '{}'", text)))
}

fn parse_byte(text: &str) -> Result<u8> {
    let value = parse_u64(text)?;
    if value > 0xFF {
        return Err(Error::msg(
            ErrorKind::InvalidArgument,
            format!("'{}' does not fit in one byte", text),
        ));
    }
    Ok(value as u8)
}

/// Parses an address argument, falling back to symbol resolution so users
/// can write `break main` as well as `break 0x4010a0`.
fn parse_location(inf: &Inferior, text: &str) -> Result<u64> {
    if text.starts_with("0x") || text.starts_with("0X") || text.chars().all(|c| c.is_ascii_digit())
    {
        parse_u64(text)
    } else {
        inf.resolve_symbol(text)
    }
}

fn print_event(event: Event) {
    let text = event.to_string();
    if !text.is_empty() {
        println!("{}", text);
    }
}

fn print_instructions(instructions: &[Instruction]) {
    for insn in instructions {
        println!("{:#018x}  {:<30}  {}", insn.addr, insn.opcodes, insn.text);
    }
}

fn require_arg<'a>(args: &[&'a str], index: usize, what: &str) -> Result<&'a str> {
    args.get(index).copied().ok_or_else(|| {
        Error::msg(ErrorKind::InvalidArgument, format!("Missing argument: {}", what))
    })
}

fn cmd_registers(inf: &mut Inferior, args: &[&str]) -> Result<()> {
    let mut regs = inf.get_regs()?;
    match args {
        [] => {
            for info in REGISTERS.iter() {
                println!("{:<10} {:#018x}", info.name, read_register(&regs, info));
            }
        }
        [name] => {
            let info = register_by_name(name).ok_or_else(|| {
                Error::msg(ErrorKind::InvalidArgument, format!("Unknown register '{}'", name))
            })?;
            println!("{:<10} {:#018x}", info.name, read_register(&regs, info));
        }
        [name, value] => {
            let info = register_by_name(name).ok_or_else(|| {
                Error::msg(ErrorKind::InvalidArgument, format!("Unknown register '{}'", name))
            })?;
            write_register(&mut regs, info, parse_u64(value)?);
            inf.set_regs(&regs)?;
        }
        _ => {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                "Usage: registers [<name> [<value>]]",
            ))
        }
    }
    Ok(())
}

fn cmd_memory(inf: &mut Inferior, args: &[&str]) -> Result<()> {
    match args {
        ["read", addr] => {
            let addr = parse_u64(addr)?;
            let word = inf.get_memory(addr)?;
            println!("{:#018x}: {:#018x}", addr, word);
        }
        ["write", addr, bytes @ ..] if !bytes.is_empty() => {
            let addr = parse_u64(addr)?;
            let data = bytes
                .iter()
                .map(|b| parse_byte(b))
                .collect::<Result<Vec<u8>>>()?;
            inf.set_memory(addr, &data)?;
        }
        _ => {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                "Usage: memory read <addr> | memory write <addr> <byte>...",
            ))
        }
    }
    Ok(())
}

fn cmd_info(inf: &mut Inferior, args: &[&str]) -> Result<()> {
    match args.first().copied() {
        Some("registers") => cmd_registers(inf, &args[1..]),
        Some("breakpoints") => {
            if inf.breakpoints().is_empty() {
                println!("No breakpoints");
                return Ok(());
            }
            for (index, bp) in inf.breakpoints().iter().enumerate() {
                println!(
                    "{:<4} {:#018x}  enabled={}  installed={}",
                    index, bp.addr, bp.enabled_logical, bp.enabled_physical
                );
            }
            Ok(())
        }
        Some("auxv") => {
            for entry in inf.auxv()? {
                match auxv_type_info(entry.a_type) {
                    Some(info) if info.decimal => {
                        println!("{:<4} {:<21} {:<20} {}", entry.a_type, entry.value, info.name, info.desc)
                    }
                    Some(info) => {
                        println!("{:<4} {:<#21x} {:<20} {}", entry.a_type, entry.value, info.name, info.desc)
                    }
                    None => println!("{:<4} {:#x}", entry.a_type, entry.value),
                }
            }
            Ok(())
        }
        Some("inferior") => {
            println!("id:       {}", inf.id());
            println!("state:    {}", inf.state());
            match inf.pid() {
                Some(pid) => println!("pid:      {}", pid),
                None => println!("pid:      -"),
            }
            println!("attached: {}", inf.is_attached());
            match inf.exec_path() {
                Some(path) => println!("file:     {}", path.display()),
                None => println!("file:     -"),
            }
            if let Some(args) = inf.args() {
                println!("args:     {}", args);
            }
            Ok(())
        }
        _ => Err(Error::msg(
            ErrorKind::InvalidArgument,
            "Usage: info registers|breakpoints|auxv|inferior",
        )),
    }
}

fn cmd_disassemble(inf: &Inferior, args: &[&str]) -> Result<()> {
    let instructions = match args {
        [start, end] => {
            let start = parse_u64(start)?;
            let end = parse_u64(end)?;
            inf.disassemble_range(start, end)?
        }
        [name] => inf.disassemble_function(name)?,
        _ => {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                "Usage: disassemble <function> | disassemble <start> <end>",
            ))
        }
    };
    print_instructions(&instructions);
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  run                         spawn the program and let it run");
    println!("  continue (c)                resume a stopped program");
    println!("  stepi (si)                  execute one instruction");
    println!("  attach <pid>                attach to a running process");
    println!("  detach                      release an attached process");
    println!("  kill                        kill the child process");
    println!("  file <path>                 choose the program to debug");
    println!("  args [<string>]             set (or clear) program arguments");
    println!("  break (b) <addr|function>   set a breakpoint");
    println!("  delete <addr>               remove a breakpoint");
    println!("  enable <addr>               enable a breakpoint");
    println!("  disable <addr>              disable a breakpoint");
    println!("  registers [<name> [<val>]]  read or write registers");
    println!("  memory read <addr>          read one word of memory");
    println!("  memory write <addr> <b>...  write bytes to memory");
    println!("  disassemble <fn|start end>  disassemble from the executable");
    println!("  symbol <name>               resolve a function name");
    println!("  info <what>                 registers|breakpoints|auxv|inferior");
    println!("  quit (q)                    leave the debugger");
}

/// Dispatches one input line against the inferior.
pub fn dispatch(line: &str, inf: &mut Inferior) -> Result<Outcome> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (command, args) = match tokens.split_first() {
        Some((command, args)) => (*command, args),
        None => return Ok(Outcome::Handled),
    };

    match command {
        "help" | "h" => print_help(),
        "quit" | "q" | "exit" => return Ok(Outcome::Quit),

        "run" | "r" => print_event(inf.run()?),
        "continue" | "c" => print_event(inf.cont()?),
        "stepi" | "si" => print_event(inf.step_instruction()?),
        "kill" => inf.kill()?,

        "attach" => {
            let pid = require_arg(args, 0, "pid")?;
            let pid = pid.parse::<i32>().map_err(|_| {
                Error::msg(ErrorKind::InvalidArgument, format!("Invalid pid '{}'", pid))
            })?;
            inf.attach(Pid::from_raw(pid))?;
            println!("Attached to process {}", pid);
        }
        "detach" => inf.detach()?,

        "file" => {
            let path = require_arg(args, 0, "path")?;
            inf.set_exec_path(path)?;
        }
        "args" => {
            // Keep the raw tail so quoting survives until spawn time.
            let raw = line.splitn(2, char::is_whitespace).nth(1).map(str::trim);
            inf.set_args(raw.filter(|rest| !rest.is_empty()));
        }

        "break" | "b" => {
            let location = require_arg(args, 0, "address or function")?;
            let addr = parse_location(inf, location)?;
            inf.breakpoint_set(addr)?;
            println!("Breakpoint set at {:#x}", addr);
        }
        "delete" => {
            let addr = parse_location(inf, require_arg(args, 0, "address")?)?;
            inf.breakpoint_unset(addr)?;
        }
        "enable" => {
            let addr = parse_location(inf, require_arg(args, 0, "address")?)?;
            inf.breakpoint_enable(addr)?;
        }
        "disable" => {
            let addr = parse_location(inf, require_arg(args, 0, "address")?)?;
            inf.breakpoint_disable(addr)?;
        }

        "registers" | "regs" => cmd_registers(inf, args)?,
        "memory" | "mem" => cmd_memory(inf, args)?,
        "disassemble" | "disas" => cmd_disassemble(inf, args)?,

        "symbol" => {
            let name = require_arg(args, 0, "name")?;
            let addr = inf.resolve_symbol(name)?;
            println!("{} = {:#x}", name, addr);
        }

        "info" => cmd_info(inf, args)?,

        _ => {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                format!("Unknown command '{}'; try 'help'", command),
            ))
        }
    }

    Ok(Outcome::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numbers() {
        assert_eq!(parse_u64("0x4010a0").unwrap(), 0x4010a0);
        assert_eq!(parse_u64("4096").unwrap(), 4096);
        assert!(parse_u64("zebra").is_err());
        assert_eq!(parse_byte("0xcc").unwrap(), 0xCC);
        assert!(parse_byte("0x100").is_err());
    }

    #[test]
    fn empty_line_is_a_no_op() {
        let mut inf = Inferior::new();
        assert_eq!(dispatch("", &mut inf).unwrap(), Outcome::Handled);
        assert_eq!(dispatch("   ", &mut inf).unwrap(), Outcome::Handled);
    }

    #[test]
    fn quit_and_unknown_commands() {
        let mut inf = Inferior::new();
        assert_eq!(dispatch("quit", &mut inf).unwrap(), Outcome::Quit);
        let err = dispatch("frobnicate", &mut inf).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn args_command_keeps_raw_tail() {
        let mut inf = Inferior::new();
        dispatch(r#"args --flag "two words""#, &mut inf).unwrap();
        assert_eq!(inf.args(), Some(r#"--flag "two words""#));
        dispatch("args", &mut inf).unwrap();
        assert_eq!(inf.args(), None);
    }

    #[test]
    fn break_by_address_without_child() {
        let mut inf = Inferior::new();
        dispatch("break 0x400500", &mut inf).unwrap();
        assert_eq!(inf.breakpoints().len(), 1);
        dispatch("delete 0x400500", &mut inf).unwrap();
        assert!(inf.breakpoints().is_empty());
    }
}

//! End-to-end tests driving real tracees. Serialized: ptrace and waitpid
//! must not interleave across test threads.

use kestrel::{ErrorKind, Event, Inferior, InferiorState};
use nix::sys::signal;
use nix::unistd::{fork, ForkResult, Pid};
use serial_test::serial;
use std::hint::black_box;
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

fn spawn_sleeper() -> (Child, Pid) {
    let child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");
    let pid = Pid::from_raw(child.id() as i32);
    // Give it a moment to get through exec.
    thread::sleep(Duration::from_millis(100));
    (child, pid)
}

#[test]
#[serial]
fn run_true_to_exit() {
    let mut inf = Inferior::new();
    inf.set_exec_path("true").unwrap();

    match inf.run().unwrap() {
        Event::Exited { code, .. } => assert_eq!(code, 0),
        other => panic!("expected a clean exit, got {:?}", other),
    }
    assert_eq!(inf.state(), InferiorState::Exited);
    assert_eq!(inf.pid(), None);
    assert!(!inf.is_attached());
}

#[test]
#[serial]
fn run_with_arguments() {
    let mut inf = Inferior::new();
    inf.set_exec_path("true").unwrap();
    inf.set_args(Some("--help"));

    match inf.run().unwrap() {
        Event::Exited { code, .. } => assert_eq!(code, 0),
        other => panic!("expected a clean exit, got {:?}", other),
    }
}

#[test]
#[serial]
fn rerun_replaces_the_previous_child() {
    let mut inf = Inferior::new();
    inf.set_exec_path("true").unwrap();
    assert!(matches!(inf.run().unwrap(), Event::Exited { .. }));
    assert!(matches!(inf.run().unwrap(), Event::Exited { .. }));
    assert_eq!(inf.state(), InferiorState::Exited);
}

#[test]
#[serial]
fn attach_inspect_detach() {
    let (mut child, pid) = spawn_sleeper();

    let mut inf = Inferior::new();
    inf.attach(pid).unwrap();
    assert_eq!(inf.state(), InferiorState::Stopped);
    assert!(inf.is_attached());
    assert!(inf.exec_path().is_some());

    // Writing back the registers we just read is invisible.
    let regs = inf.get_regs().unwrap();
    inf.set_regs(&regs).unwrap();
    let again = inf.get_regs().unwrap();
    assert_eq!(regs.rip, again.rip);
    assert_eq!(regs.rsp, again.rsp);
    assert_eq!(regs.rbp, again.rbp);

    // The auxiliary vector of a live tracee parses and is non-empty.
    let auxv = inf.auxv().unwrap();
    assert!(auxv.iter().any(|e| e.a_type == libc::AT_PAGESZ));

    inf.detach().unwrap();
    assert_eq!(inf.state(), InferiorState::None);
    assert!(!inf.is_attached());
    assert_eq!(inf.pid(), None);

    // The sleeper survived the detach.
    assert!(signal::kill(pid, None).is_ok());
    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
#[serial]
fn memory_writes_preserve_surrounding_bytes() {
    let (mut child, pid) = spawn_sleeper();

    let mut inf = Inferior::new();
    inf.attach(pid).unwrap();

    let regs = inf.get_regs().unwrap();
    let addr = regs.rsp & !7u64;
    let original = inf.get_memory(addr).unwrap();

    // Zero-length writes change nothing.
    inf.set_memory(addr, &[]).unwrap();
    assert_eq!(inf.get_memory(addr).unwrap(), original);

    // A 3-byte write touches exactly the low three bytes of the word.
    inf.set_memory(addr, &[0x11, 0x22, 0x33]).unwrap();
    let word = inf.get_memory(addr).unwrap();
    assert_eq!(word & 0x00ff_ffff, 0x0033_2211);
    assert_eq!(word & !0x00ff_ffff, original & !0x00ff_ffff);

    // A write that is not a multiple of the word size round-trips.
    let patch: Vec<u8> = (1..=11).collect();
    inf.set_memory(addr, &patch).unwrap();
    assert_eq!(inf.get_memory_range(addr, 11).unwrap(), patch);

    inf.kill().unwrap();
    assert_eq!(inf.state(), InferiorState::None);
    let _ = child.wait();
}

#[test]
#[serial]
fn attach_to_missing_process() {
    let mut inf = Inferior::new();
    let err = inf.attach(Pid::from_raw(4_194_300)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProcNotFound);
}

#[test]
#[serial]
fn drop_detaches_attached_child() {
    let (mut child, pid) = spawn_sleeper();
    {
        let mut inf = Inferior::new();
        inf.attach(pid).unwrap();
        assert_eq!(inf.state(), InferiorState::Stopped);
    }
    // Dropping the inferior released the tracee without killing it.
    assert!(signal::kill(pid, None).is_ok());
    child.kill().unwrap();
    child.wait().unwrap();
}

/// The function the forked child executes in a loop; its address is
/// identical in parent and child, which lets us place a breakpoint without
/// caring about load addresses.
#[no_mangle]
#[inline(never)]
extern "C" fn breakpoint_target(x: u64) -> u64 {
    black_box(x).wrapping_mul(2654435761).wrapping_add(1)
}

#[test]
#[serial]
fn breakpoint_hit_recovery_and_removal() {
    let addr = breakpoint_target as usize as u64;

    let child = match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let mut x = 0u64;
            loop {
                x = breakpoint_target(x);
            }
        }
        ForkResult::Parent { child } => child,
    };
    thread::sleep(Duration::from_millis(50));

    let mut inf = Inferior::new();
    inf.attach(child).unwrap();

    inf.breakpoint_set(addr).unwrap();
    let bp = *inf.breakpoints().get(0).unwrap();
    assert!(bp.enabled_logical);
    assert!(bp.enabled_physical);
    let orig_byte = bp.orig_byte;

    // The trap byte sits in the tracee's text.
    assert_eq!(inf.get_memory(addr).unwrap() & 0xff, 0xcc);

    // The loop runs into the trap.
    match inf.cont().unwrap() {
        Event::BreakpointHit { index, addr: hit } => {
            assert_eq!(index, 0);
            assert_eq!(hit, addr);
        }
        other => panic!("expected a breakpoint hit, got {:?}", other),
    }

    // Continuing steps past the trap and re-traps on the next call.
    match inf.cont().unwrap() {
        Event::BreakpointHit { addr: hit, .. } => assert_eq!(hit, addr),
        other => panic!("expected a second breakpoint hit, got {:?}", other),
    }

    // Stepping from the trap executes the displaced instruction and leaves
    // the patch re-installed.
    inf.step_instruction().unwrap();
    assert_eq!(inf.state(), InferiorState::Stopped);
    assert_eq!(inf.get_memory(addr).unwrap() & 0xff, 0xcc);

    // A disabled breakpoint passes through: the original byte is back and
    // the record survives logically.
    inf.breakpoint_disable(addr).unwrap();
    assert_eq!(inf.get_memory(addr).unwrap() & 0xff, u64::from(orig_byte));
    assert!(!inf.breakpoints().get(0).unwrap().enabled_physical);
    inf.breakpoint_enable(addr).unwrap();
    assert_eq!(inf.get_memory(addr).unwrap() & 0xff, 0xcc);

    // Removing the breakpoint restores the original byte.
    inf.breakpoint_unset(addr).unwrap();
    assert_eq!(inf.get_memory(addr).unwrap() & 0xff, u64::from(orig_byte));
    assert!(inf.breakpoints().is_empty());

    inf.kill().unwrap();
    assert_eq!(inf.state(), InferiorState::None);
}

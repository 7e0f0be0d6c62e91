use kestrel::commands::options::KestrelOptions;
use kestrel::commands::{dispatch, Outcome};
use kestrel::errors::last_error;
use kestrel::Inferior;
use log::warn;
use nix::unistd::Pid;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use structopt::StructOpt;

/// Set by the SIGINT handler, observed only by the prompt loop; an in-flight
/// operation is never aborted.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn main() {
    env_logger::init();
    let options = KestrelOptions::from_args();

    if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("could not install SIGINT handler: {}", err);
    }

    let mut inferior = Inferior::new();

    if let Some(program) = &options.program {
        if inferior.set_exec_path(program).is_err() {
            eprintln!("{}", last_error());
        }
    }
    if let Some(args) = &options.args {
        inferior.set_args(Some(args));
    }
    if let Some(pid) = options.pid {
        if inferior.attach(Pid::from_raw(pid)).is_err() {
            eprintln!("{}", last_error());
        }
    }

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        INTERRUPTED.store(false, Ordering::SeqCst);
        print!("(kestrel) ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(err) => {
                if INTERRUPTED.swap(false, Ordering::SeqCst) {
                    println!();
                    continue;
                }
                eprintln!("read error: {}", err);
                break;
            }
        }

        match dispatch(line.trim(), &mut inferior) {
            Ok(Outcome::Handled) => {}
            Ok(Outcome::Quit) => break,
            Err(_) => eprintln!("{}", last_error()),
        }
    }
}

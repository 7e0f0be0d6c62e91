use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "kestrel",
    about = "A ptrace debugger for x86-64 Linux ELF executables"
)]
pub struct KestrelOptions {
    /// Program to debug (resolved through PATH if not a file path)
    #[structopt(parse(from_os_str))]
    pub program: Option<PathBuf>,

    /// Argument string passed to the program on `run`
    #[structopt(long = "args", allow_hyphen_values = true)]
    pub args: Option<String>,

    /// Attach to a running process instead of spawning one
    #[structopt(short = "p", long = "pid")]
    pub pid: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_program_and_pid() {
        let opts = KestrelOptions::from_iter(vec!["kestrel", "/bin/true", "--pid", "42"]);
        assert_eq!(opts.program, Some(PathBuf::from("/bin/true")));
        assert_eq!(opts.pid, Some(42));
        assert_eq!(opts.args, None);
    }

    #[test]
    fn parses_args_string() {
        let opts = KestrelOptions::from_iter(vec!["kestrel", "--args", "-l -a"]);
        assert_eq!(opts.args.as_deref(), Some("-l -a"));
    }
}

//! Command-line argument handling. Zero positional arguments means REPL
//! mode; one means "run this file"; anything else is a usage error.
//! `--debug-bytecode` and `--debug-gc` toggle disassembly and GC logging.

use std::{env, fmt, path::PathBuf};

#[derive(Debug, Clone, Default)]
pub struct Args {
    pub path: Option<PathBuf>,
    pub debug_bytecode: bool,
    pub debug_gc: bool,
    pub stress_gc: bool,
}

#[derive(Debug, Clone)]
pub enum ArgsError {
    UnknownFlag(String),
    UnexpectedArgument(String),
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFlag(flag) => write!(f, "unknown flag '{flag}'"),
            Self::UnexpectedArgument(arg) => {
                write!(f, "expected at most one script path, got an extra argument '{arg}'")
            }
        }
    }
}

pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Args, ArgsError> {
    args.next(); // argv[0]
    let mut parsed = Args::default();
    for arg in args {
        match arg.as_str() {
            "--debug-bytecode" => parsed.debug_bytecode = true,
            "--debug-gc" => parsed.debug_gc = true,
            "--stress-gc" => parsed.stress_gc = true,
            _ if arg.starts_with("--") => return Err(ArgsError::UnknownFlag(arg)),
            _ if parsed.path.is_none() => parsed.path = Some(PathBuf::from(arg)),
            _ => return Err(ArgsError::UnexpectedArgument(arg)),
        }
    }
    Ok(parsed)
}

pub fn get_args() -> Result<Args, ArgsError> {
    parse(env::args())
}

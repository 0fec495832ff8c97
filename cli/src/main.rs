mod args;

use args::Args;
use rustyline::Editor;
use std::{fs, process::exit};
use vm::{InterpretError, Vm};

fn main() {
    let args = match args::get_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            exit(exitcode::USAGE);
        }
    };

    let mut vm = Vm::new();
    vm.set_debug_bytecode(args.debug_bytecode);
    vm.set_log_gc(args.debug_gc);
    vm.set_stress_gc(args.stress_gc);

    match args.path {
        Some(path) => run_file(&mut vm, path),
        None => run_repl(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: std::path::PathBuf) {
    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("can't read '{}': {err}", path.display());
            exit(exitcode::IOERR);
        }
    };
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile(errors)) => {
            for err in errors {
                eprintln!("{err}");
            }
            exit(exitcode::DATAERR);
        }
        Err(InterpretError::Runtime(err)) => {
            eprintln!("{err}");
            exit(exitcode::SOFTWARE);
        }
    }
}

/// Reads and interprets one line at a time, reusing the same `Vm` so
/// globals and classes persist across lines. A compile or runtime error is
/// reported and the REPL keeps going; only end-of-input ends the loop.
fn run_repl(vm: &mut Vm) {
    let mut editor = Editor::<()>::new().expect("failed to initialize the line editor");
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                match vm.interpret(&line) {
                    Ok(()) => {}
                    Err(InterpretError::Compile(errors)) => {
                        for err in errors {
                            eprintln!("{err}");
                        }
                    }
                    Err(InterpretError::Runtime(err)) => eprintln!("{err}"),
                }
            }
            Err(_) => break,
        }
    }
}

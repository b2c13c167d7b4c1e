// File: src/main.rs
//
// Entry point. Dispatches to `run` (compile and execute one file) or
// `repl` (interactive loop); no subcommand at all also enters the REPL,
// mirroring the teacher's `Cli { command: Commands }` shape with a
// `run`/`repl` split.

mod chunk;
mod compiler;
mod debug;
mod errors;
mod gc;
mod native;
mod repl;
mod scanner;
mod table;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use errors::{CompileError, RuntimeError};
use vm::{InterpretError, Vm};

#[derive(ClapParser)]
#[command(
    name = "lumen",
    about = "Lumen: a bytecode compiler and VM for a small dynamic scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a script file
    Run {
        /// Path to the source file
        file: PathBuf,
    },
    /// Launch the interactive REPL
    Repl,
}

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let code = match cli.command {
        None | Some(Commands::Repl) => run_repl(),
        Some(Commands::Run { file }) => run_file(&file),
    };
    ExitCode::from(code)
}

fn run_file(path: &PathBuf) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read '{}': {}", path.display(), err);
            return EXIT_IO_ERROR;
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => EXIT_OK,
        Err(InterpretError::Compile) => {
            eprintln!("{}", CompileError);
            EXIT_COMPILE_ERROR
        }
        Err(InterpretError::Runtime(message)) => {
            eprintln!("{}", RuntimeError::new(message));
            EXIT_RUNTIME_ERROR
        }
    }
}

fn run_repl() -> u8 {
    match repl::Repl::new() {
        Ok(mut repl) => {
            repl.run();
            EXIT_OK
        }
        Err(err) => {
            eprintln!("Failed to start REPL: {}", err);
            EXIT_IO_ERROR
        }
    }
}

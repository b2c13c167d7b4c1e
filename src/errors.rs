// File: src/errors.rs
//
// Diagnostic types shown to the user. Parse errors are reported directly
// by the compiler as it resynchronizes in panic mode (one line per
// distinct error, `[line N] Error ...`); `CompileError` is the trailing
// summary line `main`/`repl` print after those lines have already gone
// to stderr. `RuntimeError` wraps the message the VM built while
// unwinding its call-frame stack, formatted in the same red/blue
// register as the rest of this crate's diagnostics.

use colored::Colorize;
use std::fmt;

#[derive(Debug)]
pub struct CompileError;

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", "Compilation failed.".red().bold())
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug)]
pub struct RuntimeError {
    message: String,
}

impl RuntimeError {
    pub fn new(message: String) -> Self {
        RuntimeError { message }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = self.message.lines();
        if let Some(first) = lines.next() {
            writeln!(f, "{} {}", "Runtime Error:".red().bold(), first)?;
        }
        for trace_line in lines {
            writeln!(f, "  {}", trace_line.bright_blue())?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

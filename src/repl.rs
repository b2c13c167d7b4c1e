// File: src/repl.rs
//
// Interactive read-eval-print loop. One persistent `Vm` lives for the
// whole session so globals, functions, and classes defined on one line
// are visible on the next — unlike the teacher's multi-line brace
// buffering, each line here is its own independent `interpret()` call.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::errors::{CompileError, RuntimeError};
use crate::vm::{InterpretError, Vm};

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!(
            "{}",
            "║            Lumen REPL - Interactive Shell           ║".bright_cyan()
        );
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!();
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h  ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q  ".dimmed());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "↑/↓ arrows".bright_blue());
        println!("  {}  Clear the current line", "Ctrl+C    ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D    ".bright_blue());
        println!();
    }

    pub fn run(&mut self) {
        self.show_banner();

        loop {
            match self.editor.readline("lumen> ".bright_green().to_string().as_str()) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    let trimmed = line.trim();

                    if trimmed.is_empty() {
                        continue;
                    }

                    match trimmed {
                        ":help" | ":h" => {
                            self.show_help();
                            continue;
                        }
                        ":quit" | ":q" | ":exit" => {
                            println!("{}", "Goodbye!".bright_cyan());
                            break;
                        }
                        _ => {}
                    }

                    self.eval_line(&line);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }
    }

    fn eval_line(&mut self, line: &str) {
        match self.vm.interpret(line) {
            Ok(()) => {}
            Err(InterpretError::Compile) => {
                eprintln!("{}", CompileError);
            }
            Err(InterpretError::Runtime(message)) => {
                eprint!("{}", RuntimeError::new(message));
            }
        }
    }
}

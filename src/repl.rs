// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for Moss.
// Provides an interactive shell with:
// - Multi-line input held open while delimiters are unbalanced
// - Command history with up/down arrow navigation
// - Special commands (:help, :quit, :reset)
// - A persistent VM, so globals and classes survive across inputs

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

/// REPL session owning the editor and the VM it feeds.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(vm: Vm) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm, editor })
    }

    fn show_banner(&self) {
        println!(
            "{} {}",
            "Moss".bright_green().bold(),
            format!("v{} interactive shell", env!("CARGO_PKG_VERSION")).dimmed()
        );
        println!(
            "  Type {} for commands, {} or Ctrl+D to leave.",
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!();
    }

    /// Runs the loop until :quit or end of input.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                "moss> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        }
                        break;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        if !buffer.trim().is_empty() {
                            self.vm.interpret(&buffer);
                        }
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (input discarded, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {err}", "Error:".bright_red());
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles `:commands`; returns false when the session should end.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => false,
            ":reset" | ":r" => {
                self.vm = Vm::new();
                println!("{}", "state cleared".bright_green());
                true
            }
            _ => {
                println!(
                    "{} unknown command {}; try {}",
                    "Error:".bright_red(),
                    command.bright_yellow(),
                    ":help".bright_yellow()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "Commands".bright_cyan().bold());
        println!("  {}   this message", ":help".bright_yellow());
        println!("  {}   end the session", ":quit".bright_yellow());
        println!("  {}  discard all globals and start fresh", ":reset".bright_yellow());
        println!();
        println!("{}", "Input".bright_cyan().bold());
        println!("  Leave a brace or parenthesis open to continue on the next line;");
        println!("  close it to run the buffered input.");
        println!();
    }
}

/// True when every delimiter is balanced and no string literal is open.
/// Moss strings have no escapes and may span lines; `//` comments run to end
/// of line.
fn is_input_complete(input: &str) -> bool {
    let mut braces = 0i32;
    let mut parens = 0i32;
    let mut in_string = false;
    let mut in_comment = false;
    let mut prev = '\0';

    for c in input.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            prev = c;
            continue;
        }
        match c {
            '"' => in_string = !in_string,
            '/' if !in_string && prev == '/' => in_comment = true,
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces -= 1,
            '(' if !in_string => parens += 1,
            ')' if !in_string => parens -= 1,
            _ => {}
        }
        prev = c;
    }

    !in_string && braces <= 0 && parens <= 0
}

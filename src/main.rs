// File: src/main.rs
//
// Entry point for the Moss interpreter.
// With a script path the file is compiled and run; without one an
// interactive shell starts. Exit codes follow sysexits: 64 usage,
// 65 compile error, 70 runtime error, 74 unreadable input.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;

use moss::repl::Repl;
use moss::vm::Vm;

#[derive(ClapParser)]
#[command(
    name = "moss",
    about = "Moss: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Script to run; starts the interactive shell when omitted
    script: Option<PathBuf>,

    /// Disassemble each compiled chunk to stderr
    #[arg(long)]
    dump_bytecode: bool,

    /// Collect garbage at every allocation instead of on the heap threshold
    #[arg(long)]
    stress_gc: bool,

    /// Log collector activity to stderr
    #[arg(long)]
    log_gc: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            process::exit(64);
        }
    };

    let mut vm = Vm::new();
    vm.dump_bytecode = cli.dump_bytecode;
    vm.stress_gc = cli.stress_gc;
    vm.set_log_gc(cli.log_gc);

    match cli.script {
        Some(path) => {
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("Could not read {}: {err}", path.display());
                    process::exit(74);
                }
            };
            let result = vm.interpret(&source);
            process::exit(result.exit_code());
        }
        None => match Repl::new(vm) {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("REPL error: {err}");
                    process::exit(74);
                }
            }
            Err(err) => {
                eprintln!("Failed to start REPL: {err}");
                process::exit(74);
            }
        },
    }
}

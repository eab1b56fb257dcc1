// File: src/main.rs
//
// Command-line entry point for the Vesper language: run a script, compile
// it to a binary module, or dump its bytecode.

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::exit;

use vesper::code::disassemble;
use vesper::object::Obj;
use vesper::serialize;
use vesper::{VesperError, Vm};

// BSD-style exit codes: data errors for bad input, software for runtime
// failures.
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(ClapParser)]
#[command(
    name = "vesper",
    about = "Vesper: a small dynamically typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Vesper script
    Run {
        /// Path to the .vsp file
        file: PathBuf,
    },

    /// Compile a script to a binary module (.vbc)
    Compile {
        /// Path to the .vsp file
        file: PathBuf,

        /// Output path (defaults to the input with a .vbc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Disassemble a script's bytecode
    Dis {
        /// Path to the .vsp file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file } => run(&file),
        Commands::Compile { file, output } => compile(&file, output),
        Commands::Dis { file } => dis(&file),
    }
}

fn read_source(file: &Path) -> String {
    match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{} {}: {}", "error:".red().bold(), file.display(), e);
            exit(EX_IOERR);
        }
    }
}

fn make_vm(file: &Path) -> Vm {
    let mut vm = Vm::new();
    if let Some(dir) = file.parent() {
        if !dir.as_os_str().is_empty() {
            vm.add_search_path(dir);
        }
    }
    vm
}

fn report(err: &VesperError) -> i32 {
    match err {
        VesperError::Syntax(_) | VesperError::Compile(_) => {
            eprintln!("{}", format!("{}", err).red());
            EX_DATAERR
        }
        VesperError::Runtime(_) => {
            eprintln!("{}", err);
            EX_SOFTWARE
        }
        VesperError::Deserialize(_) | VesperError::VersionMismatch { .. } => {
            eprintln!("{} {}", "error:".red().bold(), err);
            EX_DATAERR
        }
    }
}

fn run(file: &Path) {
    let source = read_source(file);
    let mut vm = make_vm(file);
    if let Err(err) = vm.interpret(&file.display().to_string(), &source) {
        exit(report(&err));
    }
}

fn compile(file: &Path, output: Option<PathBuf>) {
    let source = read_source(file);
    let mut vm = make_vm(file);
    let module_name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    let result = vm
        .compile_source(&file.display().to_string(), &source, &module_name)
        .and_then(|function| serialize::write_module(&vm, function));
    match result {
        Ok(image) => {
            let out_path = output.unwrap_or_else(|| file.with_extension("vbc"));
            if let Err(e) = std::fs::write(&out_path, image) {
                eprintln!("{} {}: {}", "error:".red().bold(), out_path.display(), e);
                exit(EX_IOERR);
            }
        }
        Err(err) => exit(report(&err)),
    }
}

fn dis(file: &Path) {
    let source = read_source(file);
    let mut vm = make_vm(file);
    let module_name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    match vm.compile_source(&file.display().to_string(), &source, &module_name) {
        Ok(function) => {
            // Walk the function constants recursively so nested closures
            // and methods print too.
            let mut pending = vec![function];
            let mut seen = std::collections::HashSet::new();
            while let Some(f) = pending.pop() {
                if !seen.insert(f) {
                    continue;
                }
                let heap = vm.heap_ref();
                if let Obj::Function(func) = heap.get(f) {
                    let name = heap.str(func.proto.name).to_string();
                    println!("{}", disassemble(&func.code, heap, &name));
                    for &k in &func.code.consts {
                        if let vesper::Value::Obj(r) = k {
                            if matches!(heap.get(r), Obj::Function(_)) {
                                pending.push(r);
                            }
                        }
                    }
                }
            }
        }
        Err(err) => exit(report(&err)),
    }
}

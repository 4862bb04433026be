//! Command-line driver: compile a bytecode file to RV64 assembly.

use std::path::PathBuf;

use clap::Parser;

use lama_rv::CompileResult;

/// Compile Lama bytecode into RV64 assembly text.
#[derive(Parser)]
#[command(name = "lamarv", version, about)]
struct Args {
    /// Input bytecode file.
    input: PathBuf,

    /// Output assembly file. Prints to stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> CompileResult<()> {
    let asm = lama_rv::compile_file(&args.input)?;
    match &args.output {
        Some(path) => std::fs::write(path, asm)?,
        None => print!("{asm}"),
    }
    Ok(())
}

//! Command-line driver: print the envelope header and disassembly of a bytecode file.

use std::path::PathBuf;

use clap::Parser;

use lama_rv::{disassemble, ByteImage, CompileResult};

/// Dump the contents of a Lama bytecode file.
#[derive(Parser)]
#[command(name = "lamadump", version, about)]
struct Args {
    /// Input bytecode file.
    input: PathBuf,
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
    let image = ByteImage::from_file(&args.input)?;
    print!("{}", disassemble(&image)?);
    Ok(())
}

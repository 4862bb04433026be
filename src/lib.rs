//! A batch compiler translating Lama stack-machine bytecode into RV64 assembly text.
//!
//! The pipeline has three stages. [`ByteImage`] parses the bytefile envelope and
//! validates its sections. [`decode`] turns the code section into a [`Program`]: an
//! offset-keyed instruction map plus the string pool, the public symbols and the
//! global area size. [`compile`] drives a worklist over that program, tracing each
//! reachable instruction stream exactly once while modeling the operand stack
//! symbolically, and produces one self-contained assembly document.
//!
//! The operand stack never exists at run time where a register can hold it: the
//! first fifteen slots live in a fixed register pool and deeper slots spill into
//! the frame. Because slot homes depend only on the depth, the compiler verifies
//! control-flow merges by comparing depth counters, and rejects programs whose
//! paths disagree.
//!
//! ```no_run
//! use std::path::Path;
//!
//! let asm = lama_rv::compile_file(Path::new("fib.bc"))?;
//! println!("{asm}");
//! # Ok::<(), lama_rv::CompileError>(())
//! ```

pub mod bytecode;
pub mod error;
pub mod rv;
pub mod value;

pub use bytecode::{decode, disassemble, ByteImage, Program};
pub use error::{CompileError, CompileResult};
pub use rv::{compile, Compiler};

use std::path::Path;

/// Read, decode and compile a bytecode file in one step.
pub fn compile_file(path: &Path) -> CompileResult<String> {
    let image = ByteImage::from_file(path)?;
    let program = decode(&image)?;
    compile(&program)
}

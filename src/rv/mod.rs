//! RV64 code generation: registers, the symbolic stack, the emitter and the compiler.

pub mod compiler;
pub mod emit;
pub mod reg;
pub mod stack;

pub use compiler::{compile, Compiler};
pub use emit::CodeBuffer;
pub use reg::Reg;
pub use stack::{Loc, SymbolicStack};

/// Machine word size in bytes.
pub const WORD_SIZE: i64 = 8;

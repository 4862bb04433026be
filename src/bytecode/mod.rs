//! Bytecode input: the bytefile envelope, the instruction model and the decoder.

pub mod decode;
pub mod image;
pub mod insn;

pub use decode::{decode, disassemble, Program};
pub use image::ByteImage;
pub use insn::{BinopKind, Builtin, Insn, Location, PattKind};

// This module defines error types for the bytecode compiler using the thiserror crate for
// idiomatic Rust error handling. CompileError is the main error enum covering every failure
// scenario: malformed bytefile envelopes, out-of-range string/public-symbol/storage indexes,
// unknown opcodes and sub-codes, decoder/symbol-table offset mismatches, control-flow merges
// with inconsistent symbolic stack depth, symbolic stack underflow, and explicitly
// unsupported paths such as captured-variable access. Each variant carries relevant context
// (offsets, indexes, declared counts) for diagnostics. The module also provides
// CompileResult<T> as a convenience type alias for Result<T, CompileError>. Every error is
// fatal to the compilation run; there is no recoverable-error concept because the input is
// assumed to come from a conforming front end.

//! Error types for the bytecode compiler.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for bytecode compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed bytefile: {reason}")]
    MalformedImage { reason: String },

    #[error("String offset {pos} out of bounds (string table holds {size} bytes)")]
    StringOutOfBounds { pos: usize, size: usize },

    #[error("Public symbol index {index} out of bounds ({count} entries)")]
    PublicOutOfBounds { index: usize, count: usize },

    #[error("Public symbol {index} points at {offset:#010x}, outside the code section")]
    BadPublicOffset { index: usize, offset: usize },

    #[error("Unexpected end of code section at offset {offset:#010x}")]
    UnexpectedEnd { offset: usize },

    #[error("Unknown opcode {byte:#04x} at offset {offset:#010x}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("Function {name} declared at {expected:#010x} but its prologue sits at {found:#010x}")]
    PublicOffsetMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Offset {offset:#010x} reached with stack depth {found}, previously {expected}")]
    DepthMismatch {
        offset: usize,
        expected: usize,
        found: usize,
    },

    #[error("Pop from empty symbolic stack")]
    StackUnderflow,

    #[error("{kind} index {index} out of bounds ({count} declared)")]
    IndexOutOfBounds {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    #[error("Argument register number {index} out of range")]
    ArgRegisterOutOfRange { index: usize },

    #[error("No instruction at offset {offset:#010x}")]
    NoInsnAt { offset: usize },

    #[error("No current frame at offset {offset:#010x}")]
    NoFrame { offset: usize },

    #[error("Unsupported operation: {what}")]
    Unsupported { what: String },

    #[error("Tag hash: character {ch:?} not in alphabet")]
    BadTagChar { ch: char },

    #[error("Tag {tag:?} does not survive the hash round-trip (got {rehashed:?})")]
    TagHashMismatch { tag: String, rehashed: String },

    #[error("No public symbols, nothing to compile")]
    MissingEntry,
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

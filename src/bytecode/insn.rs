// This module defines the decoded instruction model for the Lama stack machine. Insn is a
// closed enum with one variant per opcode; operands are decoded into native Rust types at
// parse time (constants are boxed immediately, string operands are resolved against the
// string table, storage designators become Location values). The auxiliary enums cover the
// sub-coded families: BinopKind for the thirteen arithmetic/comparison/logic operators,
// Location for the four storage kinds (global, local, argument, captured), PattKind for the
// seven pattern checks, and Builtin for the low-level runtime calls. Every type implements
// Display with the classic disassembler mnemonics, which the lamadump tool prints verbatim.

//! The instruction model: one variant per bytecode opcode.

use std::fmt;

use crate::value::unbox_int;

/// Binary operators, numbered by the low nibble of their opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinopKind {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Equal,
    NotEqual,
    And,
    Or,
}

impl BinopKind {
    /// Decode the low nibble of a binop opcode. Zero is not a valid operator.
    pub fn from_code(low: u8) -> Option<Self> {
        Some(match low {
            1 => Self::Add,
            2 => Self::Sub,
            3 => Self::Mul,
            4 => Self::Div,
            5 => Self::Rem,
            6 => Self::LessThan,
            7 => Self::LessEqual,
            8 => Self::GreaterThan,
            9 => Self::GreaterEqual,
            10 => Self::Equal,
            11 => Self::NotEqual,
            12 => Self::And,
            13 => Self::Or,
            _ => return None,
        })
    }
}

impl fmt::Display for BinopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::LessThan => "<",
            Self::LessEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterEqual => ">=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::And => "&&",
            Self::Or => "!!",
        };
        write!(f, "{s}")
    }
}

/// A storage designator: where a value lives outside the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Global(usize),
    Local(usize),
    Arg(usize),
    Captured(usize),
}

impl Location {
    /// Decode a storage kind code and index.
    pub fn from_code(kind: u8, index: usize) -> Option<Self> {
        Some(match kind {
            0 => Self::Global(index),
            1 => Self::Local(index),
            2 => Self::Arg(index),
            3 => Self::Captured(index),
            _ => return None,
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global(i) => write!(f, "G({i})"),
            Self::Local(i) => write!(f, "L({i})"),
            Self::Arg(i) => write!(f, "A({i})"),
            Self::Captured(i) => write!(f, "C({i})"),
        }
    }
}

/// Pattern checks performed by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PattKind {
    String,
    StringTag,
    ArrayTag,
    SexpTag,
    Boxed,
    Unboxed,
    ClosureTag,
}

impl PattKind {
    pub fn from_code(low: u8) -> Option<Self> {
        Some(match low {
            0 => Self::String,
            1 => Self::StringTag,
            2 => Self::ArrayTag,
            3 => Self::SexpTag,
            4 => Self::Boxed,
            5 => Self::Unboxed,
            6 => Self::ClosureTag,
            _ => return None,
        })
    }
}

impl fmt::Display for PattKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "=str",
            Self::StringTag => "#string",
            Self::ArrayTag => "#array",
            Self::SexpTag => "#sexp",
            Self::Boxed => "#ref",
            Self::Unboxed => "#val",
            Self::ClosureTag => "#fun",
        };
        write!(f, "{s}")
    }
}

/// Built-in runtime calls with their own opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Read,
    Write,
    Length,
    String,
    Array(usize),
}

/// A decoded bytecode instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    Binop(BinopKind),
    /// Push a constant, already in its boxed representation.
    Const(i64),
    /// Push the address of string literal `index` from the program pool.
    String { index: usize, text: String },
    /// Build a tagged record from the top `nargs` values.
    Sexp { tag: String, nargs: usize },
    /// Store through the reference below the top value, keeping the value.
    Sti,
    /// Indexed assignment through the runtime.
    Sta,
    Jmp(usize),
    End,
    Ret,
    Drop,
    Dup,
    Swap,
    Elem,
    CJmp { on_zero: bool, target: usize },
    /// Function prologue. Public prologues carry their symbol name.
    Begin {
        name: Option<String>,
        nargs: usize,
        nlocals: usize,
        is_closure: bool,
    },
    /// Build a closure over `entry` capturing the listed locations.
    Closure { entry: usize, captures: Vec<Location> },
    /// Call the closure found under the `nargs` topmost values.
    CallC { nargs: usize },
    Call { target: usize, nargs: usize },
    /// Check the top value against a tag name and arity.
    Tag { tag: String, nargs: usize },
    /// Check the top value against an array of the given length.
    Array(usize),
    /// Report a pattern-match failure at the given source position.
    Fail { line: i64, col: i64 },
    Line(usize),
    Ld(Location),
    Lda(Location),
    St(Location),
    Patt(PattKind),
    Builtin(Builtin),
}

impl Insn {
    /// True when control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::End | Self::Ret | Self::Jmp(_) | Self::Fail { .. }
        )
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binop(op) => write!(f, "BINOP\t{op}"),
            Self::Const(v) => write!(f, "CONST\t{}", unbox_int(*v)),
            Self::String { text, .. } => write!(f, "STRING\t{text}"),
            Self::Sexp { tag, nargs } => write!(f, "SEXP\t{tag} {nargs}"),
            Self::Sti => write!(f, "STI"),
            Self::Sta => write!(f, "STA"),
            Self::Jmp(target) => write!(f, "JMP\t{target:#010x}"),
            Self::End => write!(f, "END"),
            Self::Ret => write!(f, "RET"),
            Self::Drop => write!(f, "DROP"),
            Self::Dup => write!(f, "DUP"),
            Self::Swap => write!(f, "SWAP"),
            Self::Elem => write!(f, "ELEM"),
            Self::CJmp { on_zero: true, target } => write!(f, "CJMPz\t{target:#010x}"),
            Self::CJmp { on_zero: false, target } => write!(f, "CJMPnz\t{target:#010x}"),
            Self::Begin {
                is_closure: false,
                nargs,
                nlocals,
                ..
            } => write!(f, "BEGIN\t{nargs} {nlocals}"),
            Self::Begin {
                is_closure: true,
                nargs,
                nlocals,
                ..
            } => write!(f, "CBEGIN\t{nargs} {nlocals}"),
            Self::Closure { entry, captures } => {
                write!(f, "CLOSURE\t{entry:#010x}")?;
                for cap in captures {
                    write!(f, " {cap}")?;
                }
                Ok(())
            }
            Self::CallC { nargs } => write!(f, "CALLC\t{nargs}"),
            Self::Call { target, nargs } => write!(f, "CALL\t{target:#010x} {nargs}"),
            Self::Tag { tag, nargs } => write!(f, "TAG\t{tag} {nargs}"),
            Self::Array(n) => write!(f, "ARRAY\t{n}"),
            Self::Fail { line, col } => write!(f, "FAIL\t{line} {col}"),
            Self::Line(n) => write!(f, "LINE\t{n}"),
            Self::Ld(loc) => write!(f, "LD\t{loc}"),
            Self::Lda(loc) => write!(f, "LDA\t{loc}"),
            Self::St(loc) => write!(f, "ST\t{loc}"),
            Self::Patt(p) => write!(f, "PATT\t{p}"),
            Self::Builtin(Builtin::Read) => write!(f, "CALL\tLread"),
            Self::Builtin(Builtin::Write) => write!(f, "CALL\tLwrite"),
            Self::Builtin(Builtin::Length) => write!(f, "CALL\tLlength"),
            Self::Builtin(Builtin::String) => write!(f, "CALL\tLstring"),
            Self::Builtin(Builtin::Array(n)) => write!(f, "CALL\tBarray\t{n}"),
        }
    }
}

// This module implements the bytecode decoder. It walks the code section byte by byte and
// produces a Program: an offset-keyed map of decoded instructions plus the string literal
// pool, the public symbol list and the global area size. Dispatch first matches the whole
// opcode byte against the standalone opcodes, then falls back on the high nibble for the
// sub-coded families (binops, loads/stores, pattern checks, builtin calls). Operands are
// 32-bit little-endian words following the opcode byte. The decoder tracks how many function
// prologues it has seen: the first N prologues correspond positionally to the N public
// symbols, and each one is cross-checked against the offset declared in the symbol table.
// Closure prologues do not participate in that numbering. Unknown opcodes, negative counts
// and truncated operands are all fatal. The module also provides the textual disassembler
// backing the lamadump tool.

//! Bytecode decoder and disassembler.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::error::{CompileError, CompileResult};
use crate::value::box_int;

use super::image::ByteImage;
use super::insn::{BinopKind, Builtin, Insn, Location, PattKind};

/// A fully decoded bytecode program.
pub struct Program {
    /// Decoded instructions keyed by the byte offset of their opcode.
    pub insns: BTreeMap<usize, Insn>,
    /// String literals in decode order; `Insn::String` refers into this pool.
    pub strings: Vec<String>,
    /// Public symbols as (name, entry offset) pairs in table order.
    pub publics: Vec<(String, usize)>,
    /// Global area size in words.
    pub globals: usize,
}

impl Program {
    /// The instruction whose opcode sits exactly at `offset`.
    pub fn insn_at(&self, offset: usize) -> CompileResult<&Insn> {
        self.insns
            .get(&offset)
            .ok_or(CompileError::NoInsnAt { offset })
    }
}

/// Decode the whole code section of an image.
pub fn decode(image: &ByteImage) -> CompileResult<Program> {
    let mut decoder = Decoder::new(image);
    let mut insns = BTreeMap::new();
    loop {
        match decoder.step()? {
            Step::Insn(offset, insn) => {
                trace!("{offset:#010x}: {insn}");
                insns.insert(offset, insn);
            }
            Step::Stop(_) => break,
        }
    }
    let mut publics = Vec::with_capacity(image.public_count());
    for i in 0..image.public_count() {
        publics.push((image.public_name(i)?.to_string(), image.public_offset(i)?));
    }
    debug!(
        "decoded {} instructions, {} string literals",
        insns.len(),
        decoder.strings.len()
    );
    Ok(Program {
        insns,
        strings: decoder.strings,
        publics,
        globals: image.globals(),
    })
}

/// Render an image the way the classic bytecode dumper does.
pub fn disassemble(image: &ByteImage) -> CompileResult<String> {
    let mut out = String::new();
    out.push_str(&format!(
        "String table size       : {}\n",
        image.stringtab_size()
    ));
    out.push_str(&format!("Global area size        : {}\n", image.globals()));
    out.push_str(&format!(
        "Number of public symbols: {}\n",
        image.public_count()
    ));
    out.push_str("Public symbols          :\n");
    for i in 0..image.public_count() {
        out.push_str(&format!(
            "   {:#010x}: {}\n",
            image.public_offset(i)?,
            image.public_name(i)?
        ));
    }
    out.push_str("Code:\n");
    let mut decoder = Decoder::new(image);
    loop {
        match decoder.step()? {
            Step::Insn(offset, insn) => out.push_str(&format!("{offset:#010x}:\t{insn}\n")),
            Step::Stop(offset) => {
                out.push_str(&format!("{offset:#010x}:\t<end>\n"));
                break;
            }
        }
    }
    Ok(out)
}

/// One decoding step: an instruction or the stream-end marker.
enum Step {
    Insn(usize, Insn),
    Stop(usize),
}

struct Decoder<'a> {
    image: &'a ByteImage,
    code: &'a [u8],
    pos: usize,
    /// Non-closure prologues seen so far; indexes the public symbol table.
    begins_seen: usize,
    strings: Vec<String>,
}

impl<'a> Decoder<'a> {
    fn new(image: &'a ByteImage) -> Self {
        Self {
            image,
            code: image.code(),
            pos: 0,
            begins_seen: 0,
            strings: Vec::new(),
        }
    }

    fn step(&mut self) -> CompileResult<Step> {
        let offset = self.pos;
        let byte = self.read_byte()?;
        let low = byte & 0x0f;

        let insn = match byte {
            0x10 => Insn::Const(box_int(self.read_int()? as i64)),
            0x11 => {
                let pos = self.read_count(offset)?;
                let text = self.image.string_at(pos)?.to_string();
                let index = self.strings.len();
                self.strings.push(text.clone());
                Insn::String { index, text }
            }
            0x12 => Insn::Sexp {
                tag: self.read_str(offset)?,
                nargs: self.read_count(offset)?,
            },
            0x13 => Insn::Sti,
            0x14 => Insn::Sta,
            0x15 => Insn::Jmp(self.read_count(offset)?),
            0x16 => Insn::End,
            0x17 => Insn::Ret,
            0x18 => Insn::Drop,
            0x19 => Insn::Dup,
            0x1a => Insn::Swap,
            0x1b => Insn::Elem,
            0x50 => Insn::CJmp {
                on_zero: true,
                target: self.read_count(offset)?,
            },
            0x51 => Insn::CJmp {
                on_zero: false,
                target: self.read_count(offset)?,
            },
            0x52 => self.read_begin(offset)?,
            0x53 => Insn::Begin {
                name: None,
                nargs: self.read_count(offset)?,
                nlocals: self.read_count(offset)?,
                is_closure: true,
            },
            0x54 => {
                let entry = self.read_count(offset)?;
                let ncaptures = self.read_count(offset)?;
                let mut captures = Vec::with_capacity(ncaptures);
                for _ in 0..ncaptures {
                    captures.push(self.read_capture(offset)?);
                }
                Insn::Closure { entry, captures }
            }
            0x55 => Insn::CallC {
                nargs: self.read_count(offset)?,
            },
            0x56 => Insn::Call {
                target: self.read_count(offset)?,
                nargs: self.read_count(offset)?,
            },
            0x57 => Insn::Tag {
                tag: self.read_str(offset)?,
                nargs: self.read_count(offset)?,
            },
            0x58 => Insn::Array(self.read_count(offset)?),
            0x59 => Insn::Fail {
                line: self.read_int()? as i64,
                col: self.read_int()? as i64,
            },
            0x5a => Insn::Line(self.read_count(offset)?),
            _ => match byte >> 4 {
                0x0 => Insn::Binop(
                    BinopKind::from_code(low)
                        .ok_or(CompileError::UnknownOpcode { offset, byte })?,
                ),
                0x2 => Insn::Ld(self.read_location(offset, byte, low)?),
                0x3 => Insn::Lda(self.read_location(offset, byte, low)?),
                0x4 => Insn::St(self.read_location(offset, byte, low)?),
                0x6 => Insn::Patt(
                    PattKind::from_code(low)
                        .ok_or(CompileError::UnknownOpcode { offset, byte })?,
                ),
                0x7 => match low {
                    0 => Insn::Builtin(Builtin::Read),
                    1 => Insn::Builtin(Builtin::Write),
                    2 => Insn::Builtin(Builtin::Length),
                    3 => Insn::Builtin(Builtin::String),
                    4 => Insn::Builtin(Builtin::Array(self.read_count(offset)?)),
                    _ => return Err(CompileError::UnknownOpcode { offset, byte }),
                },
                0xf => return Ok(Step::Stop(offset)),
                _ => return Err(CompileError::UnknownOpcode { offset, byte }),
            },
        };
        Ok(Step::Insn(offset, insn))
    }

    /// A prologue. The first prologues in stream order belong to the public
    /// symbols and must sit exactly where the symbol table says they do.
    fn read_begin(&mut self, offset: usize) -> CompileResult<Insn> {
        let index = self.begins_seen;
        self.begins_seen += 1;
        let nargs = self.read_count(offset)?;
        let nlocals = self.read_count(offset)?;
        let name = if index < self.image.public_count() {
            let declared = self.image.public_offset(index)?;
            if declared != offset {
                return Err(CompileError::PublicOffsetMismatch {
                    name: self.image.public_name(index)?.to_string(),
                    expected: declared,
                    found: offset,
                });
            }
            Some(self.image.public_name(index)?.to_string())
        } else {
            None
        };
        Ok(Insn::Begin {
            name,
            nargs,
            nlocals,
            is_closure: false,
        })
    }

    fn read_byte(&mut self) -> CompileResult<u8> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or(CompileError::UnexpectedEnd { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_int(&mut self) -> CompileResult<i32> {
        let chunk = self
            .code
            .get(self.pos..self.pos + 4)
            .ok_or(CompileError::UnexpectedEnd { offset: self.pos })?;
        self.pos += 4;
        Ok(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// A count or offset operand, which may never be negative.
    fn read_count(&mut self, offset: usize) -> CompileResult<usize> {
        let value = self.read_int()?;
        if value < 0 {
            return Err(CompileError::MalformedImage {
                reason: format!("negative operand {value} in instruction at {offset:#010x}"),
            });
        }
        Ok(value as usize)
    }

    fn read_str(&mut self, offset: usize) -> CompileResult<String> {
        let pos = self.read_count(offset)?;
        Ok(self.image.string_at(pos)?.to_string())
    }

    /// Storage designator whose kind comes from the opcode's low nibble.
    fn read_location(&mut self, offset: usize, byte: u8, kind: u8) -> CompileResult<Location> {
        let index = self.read_count(offset)?;
        Location::from_code(kind, index).ok_or(CompileError::UnknownOpcode { offset, byte })
    }

    /// Storage designator spelled as a kind byte followed by an index word.
    fn read_capture(&mut self, offset: usize) -> CompileResult<Location> {
        let kind = self.read_byte()?;
        let index = self.read_count(offset)?;
        Location::from_code(kind, index).ok_or(CompileError::UnknownOpcode { offset, byte: kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_image(globals: u32, strings: &[u8], publics: &[(u32, u32)], code: &[u8]) -> ByteImage {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&globals.to_le_bytes());
        bytes.extend_from_slice(&(publics.len() as u32).to_le_bytes());
        for &(name, offset) in publics {
            bytes.extend_from_slice(&name.to_le_bytes());
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        bytes.extend_from_slice(strings);
        bytes.extend_from_slice(code);
        ByteImage::parse(bytes).unwrap()
    }

    fn word(v: i32) -> [u8; 4] {
        v.to_le_bytes()
    }

    #[test]
    fn test_decode_straight_line() {
        let mut code = vec![0x52];
        code.extend_from_slice(&word(2));
        code.extend_from_slice(&word(0));
        code.push(0x10);
        code.extend_from_slice(&word(5));
        code.push(0x01);
        code.push(0x16);
        code.push(0xf0);
        let image = make_image(0, b"main\0", &[(0, 0)], &code);
        let program = decode(&image).unwrap();

        assert_eq!(program.insns.len(), 4);
        assert_eq!(
            program.insns[&0],
            Insn::Begin {
                name: Some("main".into()),
                nargs: 2,
                nlocals: 0,
                is_closure: false
            }
        );
        assert_eq!(program.insns[&9], Insn::Const(box_int(5)));
        assert_eq!(program.insns[&14], Insn::Binop(BinopKind::Add));
        assert_eq!(program.insns[&15], Insn::End);
        assert_eq!(program.publics, vec![("main".to_string(), 0)]);
    }

    #[test]
    fn test_public_offset_cross_check() {
        // Symbol table claims main starts at 5, the prologue is at 0.
        let mut code = vec![0x52];
        code.extend_from_slice(&word(2));
        code.extend_from_slice(&word(0));
        code.push(0x16);
        code.push(0xf0);
        let image = make_image(0, b"main\0", &[(0, 5)], &code);
        assert!(matches!(
            decode(&image),
            Err(CompileError::PublicOffsetMismatch { expected: 5, found: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let image = make_image(0, b"", &[], &[0xe0]);
        assert!(matches!(
            decode(&image),
            Err(CompileError::UnknownOpcode { offset: 0, byte: 0xe0 })
        ));
    }

    #[test]
    fn test_binop_zero_is_invalid() {
        let image = make_image(0, b"", &[], &[0x00]);
        assert!(matches!(
            decode(&image),
            Err(CompileError::UnknownOpcode { offset: 0, byte: 0x00 })
        ));
    }

    #[test]
    fn test_missing_stream_end() {
        let mut code = vec![0x10];
        code.extend_from_slice(&word(1));
        let image = make_image(0, b"", &[], &code);
        assert!(matches!(
            decode(&image),
            Err(CompileError::UnexpectedEnd { offset: 5 })
        ));
    }

    #[test]
    fn test_truncated_operand() {
        let image = make_image(0, b"", &[], &[0x10, 1, 0]);
        assert!(matches!(
            decode(&image),
            Err(CompileError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn test_decode_closure_captures() {
        let mut code = vec![0x54];
        code.extend_from_slice(&word(32));
        code.extend_from_slice(&word(2));
        code.push(1);
        code.extend_from_slice(&word(0));
        code.push(2);
        code.extend_from_slice(&word(1));
        code.push(0xf0);
        let image = make_image(0, b"", &[], &code);
        let program = decode(&image).unwrap();
        assert_eq!(
            program.insns[&0],
            Insn::Closure {
                entry: 32,
                captures: vec![Location::Local(0), Location::Arg(1)]
            }
        );
    }

    #[test]
    fn test_string_literals_go_to_pool() {
        let mut code = vec![0x11];
        code.extend_from_slice(&word(0));
        code.push(0x11);
        code.extend_from_slice(&word(6));
        code.push(0xf0);
        let image = make_image(0, b"hello\0world\0", &[], &code);
        let program = decode(&image).unwrap();
        assert_eq!(program.strings, vec!["hello".to_string(), "world".to_string()]);
        assert_eq!(
            program.insns[&0],
            Insn::String { index: 0, text: "hello".into() }
        );
        assert_eq!(
            program.insns[&5],
            Insn::String { index: 1, text: "world".into() }
        );
    }

    #[test]
    fn test_negative_count_rejected() {
        let mut code = vec![0x58];
        code.extend_from_slice(&word(-3));
        let image = make_image(0, b"", &[], &code);
        assert!(matches!(
            decode(&image),
            Err(CompileError::MalformedImage { .. })
        ));
    }

    #[test]
    fn test_disassemble_format() {
        let mut code = vec![0x52];
        code.extend_from_slice(&word(2));
        code.extend_from_slice(&word(1));
        code.push(0x10);
        code.extend_from_slice(&word(7));
        code.push(0x16);
        code.push(0xf0);
        let image = make_image(3, b"main\0", &[(0, 0)], &code);
        let text = disassemble(&image).unwrap();
        assert!(text.contains("String table size       : 5"));
        assert!(text.contains("Global area size        : 3"));
        assert!(text.contains("Number of public symbols: 1"));
        assert!(text.contains("   0x00000000: main"));
        assert!(text.contains("0x00000000:\tBEGIN\t2 1"));
        assert!(text.contains("0x00000009:\tCONST\t7"));
        assert!(text.contains("0x0000000e:\tEND"));
        assert!(text.contains("0x0000000f:\t<end>"));
    }
}

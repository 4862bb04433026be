// This module implements the assembly text emitter. CodeBuffer is an append-only buffer of
// assembly lines with two layers: physical emitters that format one RV64 instruction per
// line (tab-separated operands, memory operands as offset(base)), and symbolic emitters that
// accept Loc operands from the symbolic stack and resolve them on the fly. Register slots
// resolve to themselves; spilled slots are loaded into one of the two reserved scratch
// registers before the instruction and stored back afterwards when they are the destination.
// Spill slots are addressed relative to fp, below the locals and the saved-register area, so
// their addresses stay valid while sp moves around a call sequence. The buffer carries the
// current frame's word count to place them; the compiler refreshes it at every prologue.

//! Assembly emission with symbolic-location resolution.

use super::reg::{self, Reg};
use super::stack::Loc;
use super::WORD_SIZE;

/// Append-only assembly text buffer.
pub struct CodeBuffer {
    out: String,
    /// Locals plus saved registers of the current frame, in words. Spill
    /// slots start right below this area.
    frame_words: i64,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            out: String::new(),
            frame_words: 0,
        }
    }

    /// Install the frame extent of the function being compiled.
    pub fn set_frame_words(&mut self, words: i64) {
        self.frame_words = words;
    }

    /// fp-relative offset of a numbered spill slot.
    fn spill_offset(&self, slot: usize) -> i64 {
        -(self.frame_words + slot as i64 + 1) * WORD_SIZE
    }

    /// Append one raw line.
    pub fn emit(&mut self, line: &str) {
        self.out.push_str(line);
        self.out.push('\n');
    }

    pub fn into_text(self) -> String {
        self.out
    }

    // -------- physical emitters --------

    pub fn r_type(&mut self, insn: &str, dst: Reg, src1: Reg, src2: Reg) {
        self.emit(&format!("{insn}\t{dst},\t{src1},\t{src2}"));
    }

    pub fn i_type(&mut self, insn: &str, dst: Reg, src: Reg, imm: i64) {
        self.emit(&format!("{insn}\t{dst},\t{src},\t{imm}"));
    }

    pub fn addi(&mut self, dst: Reg, src: Reg, imm: i64) {
        self.i_type("addi", dst, src, imm);
    }

    fn mem(&mut self, insn: &str, reg: Reg, base: Reg, offset: i64) {
        self.emit(&format!("{insn}\t{reg},\t{offset}({base})"));
    }

    pub fn ld(&mut self, reg: Reg, base: Reg, offset: i64) {
        self.mem("ld", reg, base, offset);
    }

    pub fn sd(&mut self, reg: Reg, base: Reg, offset: i64) {
        self.mem("sd", reg, base, offset);
    }

    pub fn li(&mut self, dst: Reg, imm: i64) {
        self.emit(&format!("li\t{dst},\t{imm}"));
    }

    pub fn la(&mut self, dst: Reg, label: &str) {
        self.emit(&format!("la\t{dst},\t{label}"));
    }

    pub fn mv(&mut self, dst: Reg, src: Reg) {
        self.emit(&format!("mv\t{dst},\t{src}"));
    }

    /// One-source pseudo-instructions such as seqz and snez.
    pub fn unary(&mut self, insn: &str, dst: Reg, src: Reg) {
        self.emit(&format!("{insn}\t{dst},\t{src}"));
    }

    pub fn call(&mut self, target: &str) {
        self.emit(&format!("call\t{target}"));
    }

    pub fn jalr(&mut self, target: Reg) {
        self.emit(&format!("jalr\t{target}"));
    }

    pub fn ret(&mut self) {
        self.emit("ret");
    }

    pub fn j(&mut self, label: &str) {
        self.emit(&format!("j\t{label}"));
    }

    pub fn branch(&mut self, insn: &str, src1: Reg, src2: Reg, label: &str) {
        self.emit(&format!("{insn}\t{src1},\t{src2},\t{label}"));
    }

    pub fn label(&mut self, name: &str) {
        self.emit(&format!("{name}:"));
    }

    pub fn comment(&mut self, text: &str) {
        self.emit(&format!("# {text}"));
    }

    // -------- symbolic resolution --------

    /// Resolve a location into a readable register, loading spilled slots
    /// into the given scratch register.
    pub fn to_reg(&mut self, loc: Loc, scratch: Reg) -> Reg {
        match loc {
            Loc::Register(r) => r,
            Loc::Memory(slot) => {
                let offset = self.spill_offset(slot);
                self.ld(scratch, reg::FP, offset);
                scratch
            }
        }
    }

    /// Register a destination location computes into.
    fn dst_reg(&self, loc: Loc, scratch: Reg) -> Reg {
        match loc {
            Loc::Register(r) => r,
            Loc::Memory(_) => scratch,
        }
    }

    /// Store a computed value back if its home is a spill slot.
    fn writeback(&mut self, loc: Loc, src: Reg) {
        if let Loc::Memory(slot) = loc {
            let offset = self.spill_offset(slot);
            self.sd(src, reg::FP, offset);
        }
    }

    pub fn symb_li(&mut self, dst: Loc, imm: i64) {
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.li(d, imm);
        self.writeback(dst, d);
    }

    pub fn symb_la(&mut self, dst: Loc, label: &str) {
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.la(d, label);
        self.writeback(dst, d);
    }

    pub fn symb_r_type(&mut self, insn: &str, dst: Loc, src1: Loc, src2: Loc) {
        let r1 = self.to_reg(src1, reg::SCRATCH1);
        let r2 = self.to_reg(src2, reg::SCRATCH2);
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.r_type(insn, d, r1, r2);
        self.writeback(dst, d);
    }

    pub fn symb_i_type(&mut self, insn: &str, dst: Loc, src: Loc, imm: i64) {
        let r = self.to_reg(src, reg::SCRATCH1);
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.i_type(insn, d, r, imm);
        self.writeback(dst, d);
    }

    /// Load from offset(base) into a symbolic destination.
    pub fn symb_ld(&mut self, dst: Loc, base: Reg, offset: i64) {
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.ld(d, base, offset);
        self.writeback(dst, d);
    }

    /// Store a symbolic value to offset(base).
    pub fn symb_sd(&mut self, src: Loc, base: Reg, offset: i64) {
        let r = self.to_reg(src, reg::SCRATCH1);
        self.sd(r, base, offset);
    }

    /// Materialize base+offset into a symbolic destination.
    pub fn symb_addr(&mut self, dst: Loc, base: Reg, offset: i64) {
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.addi(d, base, offset);
        self.writeback(dst, d);
    }

    /// Store a symbolic value through a symbolic pointer.
    pub fn symb_store_through(&mut self, value: Loc, ptr: Loc) {
        let v = self.to_reg(value, reg::SCRATCH1);
        let p = self.to_reg(ptr, reg::SCRATCH2);
        self.sd(v, p, 0);
    }

    pub fn symb_mv(&mut self, dst: Loc, src: Loc) {
        match (dst, src) {
            (Loc::Register(d), Loc::Register(s)) => self.mv(d, s),
            (Loc::Register(d), Loc::Memory(slot)) => {
                let offset = self.spill_offset(slot);
                self.ld(d, reg::FP, offset);
            }
            (Loc::Memory(slot), Loc::Register(s)) => {
                let offset = self.spill_offset(slot);
                self.sd(s, reg::FP, offset);
            }
            (Loc::Memory(_), Loc::Memory(_)) => {
                let r = self.to_reg(src, reg::SCRATCH1);
                self.writeback(dst, r);
            }
        }
    }

    /// Move a symbolic value into a fixed register.
    pub fn symb_mv_to_reg(&mut self, dst: Reg, src: Loc) {
        match src {
            Loc::Register(s) => self.mv(dst, s),
            Loc::Memory(slot) => {
                let offset = self.spill_offset(slot);
                self.ld(dst, reg::FP, offset);
            }
        }
    }

    /// Move a fixed register into a symbolic destination.
    pub fn symb_mv_from_reg(&mut self, dst: Loc, src: Reg) {
        match dst {
            Loc::Register(d) => self.mv(d, src),
            Loc::Memory(slot) => {
                let offset = self.spill_offset(slot);
                self.sd(src, reg::FP, offset);
            }
        }
    }

    // -------- synthesized comparisons --------

    pub fn symb_eq(&mut self, dst: Loc, src1: Loc, src2: Loc) {
        let r1 = self.to_reg(src1, reg::SCRATCH1);
        let r2 = self.to_reg(src2, reg::SCRATCH2);
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.r_type("sub", d, r1, r2);
        self.unary("seqz", d, d);
        self.writeback(dst, d);
    }

    pub fn symb_neq(&mut self, dst: Loc, src1: Loc, src2: Loc) {
        let r1 = self.to_reg(src1, reg::SCRATCH1);
        let r2 = self.to_reg(src2, reg::SCRATCH2);
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.r_type("sub", d, r1, r2);
        self.unary("snez", d, d);
        self.writeback(dst, d);
    }

    /// Less-or-equal as the negation of greater-than.
    pub fn symb_sle(&mut self, dst: Loc, src1: Loc, src2: Loc) {
        let r1 = self.to_reg(src1, reg::SCRATCH1);
        let r2 = self.to_reg(src2, reg::SCRATCH2);
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.r_type("sgt", d, r1, r2);
        self.i_type("xori", d, d, 1);
        self.writeback(dst, d);
    }

    /// Greater-or-equal as the negation of less-than.
    pub fn symb_sge(&mut self, dst: Loc, src1: Loc, src2: Loc) {
        let r1 = self.to_reg(src1, reg::SCRATCH1);
        let r2 = self.to_reg(src2, reg::SCRATCH2);
        let d = self.dst_reg(dst, reg::SCRATCH1);
        self.r_type("slt", d, r1, r2);
        self.i_type("xori", d, d, 1);
        self.writeback(dst, d);
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

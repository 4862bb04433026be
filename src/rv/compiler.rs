// This module implements the single-pass bytecode compiler. Compilation is driven by a
// worklist of (offset, expected stack depth) pairs: every public symbol seeds the worklist
// at its prologue's argument count, and tracing an instruction stream registers further
// targets at every jump, call and closure creation. A trace runs linearly from its start
// offset, assigning each visited offset the current symbolic stack depth, until it hits a
// terminator or falls into code that is already generated, in which case it re-checks the
// recorded depth and emits an unconditional jump to the existing label. Reaching any offset
// twice with different depths is a fatal front-end inconsistency. Each instruction is
// translated independently against the symbolic stack; calls expand into a full
// caller-save/argument-placement/teardown sequence that keeps sp 16-byte aligned at the
// call instruction. The final document wraps the generated text with the rodata string
// pool, the global area and the .text header, and a table of closure entry labels trails
// the code for runtime dispatch.

//! Single-pass translation of decoded bytecode into RV64 assembly text.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};

use crate::bytecode::{BinopKind, Builtin, Insn, Location, PattKind, Program};
use crate::error::{CompileError, CompileResult};
use crate::value::{box_int, tag_hash};

use super::emit::CodeBuffer;
use super::reg::{self, Reg};
use super::stack::SymbolicStack;
use super::WORD_SIZE;

/// Compile a decoded program into one assembly document.
pub fn compile(program: &Program) -> CompileResult<String> {
    Compiler::new(program).run()
}

/// The function whose body is currently being generated.
#[derive(Debug, Clone)]
struct FrameInfo {
    function_name: String,
    locals_count: usize,
    args_count: usize,
}

/// Callee of a full calling-convention sequence.
enum CallTarget {
    /// External runtime symbol.
    Name(&'static str),
    /// Bytecode function by entry offset.
    Offset(usize),
    /// Closure value popped off the symbolic stack after the arguments.
    Closure,
}

pub struct Compiler<'p> {
    program: &'p Program,
    st: SymbolicStack,
    cb: CodeBuffer,
    current_frame: Option<FrameInfo>,
    /// Offsets already generated, with the stack depth they were entered at.
    done: BTreeMap<usize, usize>,
    /// Offsets waiting for generation, with their expected entry depth.
    todo: BTreeMap<usize, usize>,
    /// Entry offsets of every closure built, for the dispatch table.
    closure_offsets: BTreeSet<usize>,
}

fn label_for(offset: usize) -> String {
    format!("label_for_{offset}")
}

impl<'p> Compiler<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            st: SymbolicStack::new(),
            cb: CodeBuffer::new(),
            current_frame: None,
            done: BTreeMap::new(),
            todo: BTreeMap::new(),
            closure_offsets: BTreeSet::new(),
        }
    }

    /// Drive the worklist to completion and assemble the final document.
    pub fn run(mut self) -> CompileResult<String> {
        if self.program.publics.is_empty() {
            return Err(CompileError::MissingEntry);
        }
        let publics = self.program.publics.clone();
        for (name, offset) in &publics {
            let argc = self.begin_argc(*offset)?;
            self.add_jump_target(*offset, argc)?;
            debug!("seeding {name} at {offset:#010x} with depth {argc}");
        }
        while let Some((offset, depth)) = self.todo.pop_first() {
            if let Some(&have) = self.done.get(&offset) {
                if have != depth {
                    return Err(CompileError::DepthMismatch {
                        offset,
                        expected: have,
                        found: depth,
                    });
                }
                continue;
            }
            self.st.set_depth(depth);
            debug!("tracing from {offset:#010x} at depth {depth}");
            self.trace(offset)?;
        }
        debug!("generated code for {} offsets", self.done.len());
        Ok(self.assemble())
    }

    /// Generate one linear trace starting at `start`.
    fn trace(&mut self, start: usize) -> CompileResult<()> {
        let mut offset = start;
        loop {
            if !self.should_emit(offset) {
                // Control falls into code that already exists.
                self.add_jump_target(offset, self.st.depth())?;
                self.cb.j(&label_for(offset));
                return Ok(());
            }
            let insn = self.program.insn_at(offset)?.clone();
            self.inst_begin(offset)?;
            trace!("{offset:#010x}: {insn} (depth {})", self.st.depth());
            self.emit_insn(offset, &insn)?;
            if insn.is_terminator() {
                return Ok(());
            }
            offset = self.next_offset(offset)?;
        }
    }

    fn should_emit(&self, offset: usize) -> bool {
        !self.done.contains_key(&offset)
    }

    /// Record the entry depth of an offset and place its label. Re-entry at
    /// the recorded depth only leaves a comment; any other depth is fatal.
    fn inst_begin(&mut self, offset: usize) -> CompileResult<()> {
        let depth = self.st.depth();
        match self.done.insert(offset, depth) {
            None => self.cb.label(&label_for(offset)),
            Some(have) if have == depth => {
                self.cb.comment(&format!("revisiting {offset:#010x}"));
            }
            Some(have) => {
                return Err(CompileError::DepthMismatch {
                    offset,
                    expected: have,
                    found: depth,
                });
            }
        }
        Ok(())
    }

    /// Register `offset` as a control-flow target expecting `depth` values.
    fn add_jump_target(&mut self, offset: usize, depth: usize) -> CompileResult<()> {
        if let Some(&have) = self.done.get(&offset) {
            if have != depth {
                return Err(CompileError::DepthMismatch {
                    offset,
                    expected: have,
                    found: depth,
                });
            }
            return Ok(());
        }
        if let Some(&pending) = self.todo.get(&offset) {
            if pending != depth {
                return Err(CompileError::DepthMismatch {
                    offset,
                    expected: pending,
                    found: depth,
                });
            }
        } else {
            self.todo.insert(offset, depth);
        }
        Ok(())
    }

    /// Offset of the instruction following `offset` in the decoded stream.
    fn next_offset(&self, offset: usize) -> CompileResult<usize> {
        self.program
            .insns
            .range(offset + 1..)
            .next()
            .map(|(&next, _)| next)
            .ok_or(CompileError::UnexpectedEnd { offset })
    }

    /// Declared argument count of the prologue at `offset`.
    fn begin_argc(&self, offset: usize) -> CompileResult<usize> {
        match self.program.insn_at(offset)? {
            Insn::Begin { nargs, .. } => Ok(*nargs),
            _ => Err(CompileError::MalformedImage {
                reason: format!("offset {offset:#010x} is not a function prologue"),
            }),
        }
    }

    fn frame(&self, offset: usize) -> CompileResult<&FrameInfo> {
        self.current_frame
            .as_ref()
            .ok_or(CompileError::NoFrame { offset })
    }

    fn emit_insn(&mut self, offset: usize, insn: &Insn) -> CompileResult<()> {
        match insn {
            Insn::Binop(kind) => self.emit_binop(*kind)?,

            Insn::Const(value) => {
                let dst = self.st.alloc();
                self.cb.symb_li(dst, *value);
            }

            Insn::String { index, .. } => {
                let dst = self.st.alloc();
                self.cb.symb_la(dst, &format!("string_{index}"));
                self.compile_call(offset, CallTarget::Name("Bstring"), 1, None)?;
            }

            Insn::Sexp { tag, nargs } => {
                let hash = tag_hash(tag)?;
                let dst = self.st.alloc();
                self.cb.symb_li(dst, hash);
                let argc = nargs + 1;
                self.compile_call(
                    offset,
                    CallTarget::Name("Bsexp"),
                    argc,
                    Some(box_int(argc as i64)),
                )?;
            }

            Insn::Sti => {
                let value = self.st.pop()?;
                let ptr = self.st.pop()?;
                self.st.push(value);
                self.cb.symb_store_through(value, ptr);
            }

            Insn::Sta => self.compile_call(offset, CallTarget::Name("Bsta"), 3, None)?,

            Insn::Jmp(target) => {
                self.cb.j(&label_for(*target));
                self.add_jump_target(*target, self.st.depth())?;
            }

            Insn::End | Insn::Ret => self.emit_epilogue(offset)?,

            Insn::Drop => {
                self.st.pop()?;
            }

            Insn::Dup => {
                let src = self.st.peek()?;
                let dst = self.st.alloc();
                self.cb.symb_mv(dst, src);
            }

            Insn::Swap => {
                let first = self.st.pop()?;
                let second = self.st.pop()?;
                self.st.push(second);
                self.st.push(first);
                self.cb.symb_mv_to_reg(reg::SCRATCH2, first);
                self.cb.symb_mv(first, second);
                self.cb.symb_mv_from_reg(second, reg::SCRATCH2);
            }

            Insn::Elem => self.compile_call(offset, CallTarget::Name("Belem"), 2, None)?,

            Insn::CJmp { on_zero, target } => {
                let cond = self.st.pop()?;
                let r = self.cb.to_reg(cond, reg::SCRATCH1);
                self.cb.i_type("srai", r, r, 1);
                let op = if *on_zero { "beq" } else { "bne" };
                self.cb.branch(op, r, reg::ZERO, &label_for(*target));
                self.add_jump_target(*target, self.st.depth())?;
            }

            Insn::Begin {
                name,
                nargs,
                nlocals,
                ..
            } => self.emit_prologue(offset, name.as_deref(), *nargs, *nlocals),

            Insn::Closure { entry, captures } => {
                let argc = self.begin_argc(*entry)?;
                self.add_jump_target(*entry, argc)?;
                self.closure_offsets.insert(*entry);
                for capture in captures {
                    self.load_location(offset, *capture)?;
                }
                let dst = self.st.alloc();
                self.cb.symb_la(dst, &label_for(*entry));
                let call_argc = captures.len() + 1;
                self.compile_call(
                    offset,
                    CallTarget::Name("Bclosure"),
                    call_argc,
                    Some(box_int(call_argc as i64)),
                )?;
            }

            Insn::CallC { nargs } => self.compile_call(offset, CallTarget::Closure, *nargs, None)?,

            Insn::Call { target, nargs } => {
                self.compile_call(offset, CallTarget::Offset(*target), *nargs, None)?;
            }

            Insn::Tag { tag, nargs } => {
                let hash = tag_hash(tag)?;
                let h = self.st.alloc();
                self.cb.symb_li(h, hash);
                let n = self.st.alloc();
                self.cb.symb_li(n, box_int(*nargs as i64));
                self.compile_call(offset, CallTarget::Name("Btag"), 3, None)?;
            }

            Insn::Array(len) => {
                let n = self.st.alloc();
                self.cb.symb_li(n, box_int(*len as i64));
                self.compile_call(offset, CallTarget::Name("Barray_patt"), 2, None)?;
            }

            Insn::Fail { line, col } => {
                let l = self.st.alloc();
                self.cb.symb_li(l, box_int(*line));
                let c = self.st.alloc();
                self.cb.symb_li(c, box_int(*col));
                self.compile_call(offset, CallTarget::Name("Bmatch_failure"), 3, None)?;
            }

            Insn::Line(line) => self.cb.comment(&format!("LINE {line}")),

            Insn::Ld(loc) => self.load_location(offset, *loc)?,
            Insn::Lda(loc) => self.load_address(offset, *loc)?,
            Insn::St(loc) => self.store_location(offset, *loc)?,

            Insn::Patt(kind) => {
                let (name, argc) = match kind {
                    PattKind::String => ("Bstring_patt", 2),
                    PattKind::StringTag => ("Bstring_tag_patt", 1),
                    PattKind::ArrayTag => ("Barray_tag_patt", 1),
                    PattKind::SexpTag => ("Bsexp_tag_patt", 1),
                    PattKind::Boxed => ("Bboxed_patt", 1),
                    PattKind::Unboxed => ("Bunboxed_patt", 1),
                    PattKind::ClosureTag => ("Bclosure_tag_patt", 1),
                };
                self.compile_call(offset, CallTarget::Name(name), argc, None)?;
            }

            Insn::Builtin(builtin) => match builtin {
                Builtin::Read => self.compile_call(offset, CallTarget::Name("Lread"), 0, None)?,
                Builtin::Write => self.compile_call(offset, CallTarget::Name("Lwrite"), 1, None)?,
                Builtin::Length => {
                    self.compile_call(offset, CallTarget::Name("Llength"), 1, None)?;
                }
                Builtin::String => {
                    self.compile_call(offset, CallTarget::Name("Lstring"), 1, None)?;
                }
                Builtin::Array(len) => self.compile_call(
                    offset,
                    CallTarget::Name("Barray"),
                    *len,
                    Some(box_int(*len as i64)),
                )?,
            },
        }
        Ok(())
    }

    /// Untag both operands, apply the operator and retag the result.
    fn emit_binop(&mut self, kind: BinopKind) -> CompileResult<()> {
        let second = self.st.pop()?;
        let first = self.st.pop()?;
        let dst = self.st.alloc();
        self.cb.symb_i_type("srai", first, first, 1);
        self.cb.symb_i_type("srai", second, second, 1);
        match kind {
            BinopKind::Add => self.cb.symb_r_type("add", dst, first, second),
            BinopKind::Sub => self.cb.symb_r_type("sub", dst, first, second),
            BinopKind::Mul => self.cb.symb_r_type("mul", dst, first, second),
            BinopKind::Div => self.cb.symb_r_type("div", dst, first, second),
            BinopKind::Rem => self.cb.symb_r_type("rem", dst, first, second),
            BinopKind::LessThan => self.cb.symb_r_type("slt", dst, first, second),
            BinopKind::GreaterThan => self.cb.symb_r_type("sgt", dst, first, second),
            BinopKind::And => self.cb.symb_r_type("and", dst, first, second),
            BinopKind::Or => self.cb.symb_r_type("or", dst, first, second),
            BinopKind::LessEqual => self.cb.symb_sle(dst, first, second),
            BinopKind::GreaterEqual => self.cb.symb_sge(dst, first, second),
            BinopKind::Equal => self.cb.symb_eq(dst, first, second),
            BinopKind::NotEqual => self.cb.symb_neq(dst, first, second),
        }
        self.cb.symb_i_type("slli", dst, dst, 1);
        self.cb.symb_i_type("addi", dst, dst, 1);
        Ok(())
    }

    /// Function prologue: name label, global-area setup for main, saved
    /// registers below the locals area, then the new fp and sp.
    fn emit_prologue(&mut self, offset: usize, name: Option<&str>, nargs: usize, nlocals: usize) {
        let label = match name {
            Some(n) => {
                self.cb.label(n);
                n.to_string()
            }
            None => label_for(offset),
        };
        if label == "main" {
            self.cb.emit("sd\tgp,\tsaved_gp,\tt0");
            self.cb.emit("la\tgp,\tglobals");
        }
        self.current_frame = Some(FrameInfo {
            function_name: label,
            locals_count: nlocals,
            args_count: nargs,
        });
        for (i, r) in reg::SAVED.iter().enumerate() {
            self.cb.sd(*r, reg::SP, -((i + 1 + nlocals) as i64) * WORD_SIZE);
        }
        self.cb.mv(reg::FP, reg::SP);
        let frame_words = (nlocals + reg::SAVED.len()) as i64;
        self.cb.addi(reg::SP, reg::SP, -frame_words * WORD_SIZE);
        self.cb.set_frame_words(frame_words);
    }

    /// Function epilogue: result to a0, frame torn down, saved registers
    /// back, and for main the exit-code untagging and gp restore.
    fn emit_epilogue(&mut self, offset: usize) -> CompileResult<()> {
        let (name, locals) = {
            let frame = self.frame(offset)?;
            (frame.function_name.clone(), frame.locals_count)
        };
        let result = self.st.pop()?;
        self.cb.symb_mv_to_reg(reg::A0, result);
        self.cb.mv(reg::SP, reg::FP);
        for (i, r) in reg::SAVED.iter().enumerate() {
            self.cb.ld(*r, reg::SP, -((i + 1 + locals) as i64) * WORD_SIZE);
        }
        if name == "main" {
            self.cb.i_type("srai", reg::A0, reg::A0, 1);
            self.cb.emit("ld\tgp,\tsaved_gp");
        }
        self.cb.ret();
        Ok(())
    }

    fn load_location(&mut self, offset: usize, loc: Location) -> CompileResult<()> {
        match loc {
            Location::Global(index) => {
                self.check_global(index)?;
                let dst = self.st.alloc();
                self.cb.symb_ld(dst, reg::GP, index as i64 * WORD_SIZE);
            }
            Location::Local(index) => {
                self.check_local(offset, index)?;
                let dst = self.st.alloc();
                self.cb.symb_ld(dst, reg::FP, -(index as i64 + 1) * WORD_SIZE);
            }
            Location::Arg(index) => {
                self.check_arg(offset, index)?;
                let dst = self.st.alloc();
                if index < reg::ARGS.len() {
                    self.cb.symb_mv_from_reg(dst, reg::arg(index)?);
                } else {
                    let off = (index - reg::ARGS.len()) as i64 * WORD_SIZE;
                    self.cb.symb_ld(dst, reg::FP, off);
                }
            }
            Location::Captured(_) => {
                return Err(CompileError::Unsupported {
                    what: format!("captured-variable load at {offset:#010x}"),
                });
            }
        }
        Ok(())
    }

    /// Store the top value without popping it.
    fn store_location(&mut self, offset: usize, loc: Location) -> CompileResult<()> {
        let value = self.st.peek()?;
        match loc {
            Location::Global(index) => {
                self.check_global(index)?;
                self.cb.symb_sd(value, reg::GP, index as i64 * WORD_SIZE);
            }
            Location::Local(index) => {
                self.check_local(offset, index)?;
                self.cb.symb_sd(value, reg::FP, -(index as i64 + 1) * WORD_SIZE);
            }
            Location::Arg(index) => {
                self.check_arg(offset, index)?;
                if index < reg::ARGS.len() {
                    self.cb.symb_mv_to_reg(reg::arg(index)?, value);
                } else {
                    let off = (index - reg::ARGS.len()) as i64 * WORD_SIZE;
                    self.cb.symb_sd(value, reg::FP, off);
                }
            }
            Location::Captured(_) => {
                return Err(CompileError::Unsupported {
                    what: format!("captured-variable store at {offset:#010x}"),
                });
            }
        }
        Ok(())
    }

    fn load_address(&mut self, offset: usize, loc: Location) -> CompileResult<()> {
        match loc {
            Location::Global(index) => {
                self.check_global(index)?;
                let dst = self.st.alloc();
                self.cb.symb_addr(dst, reg::GP, index as i64 * WORD_SIZE);
            }
            Location::Local(index) => {
                self.check_local(offset, index)?;
                let dst = self.st.alloc();
                self.cb.symb_addr(dst, reg::FP, -(index as i64 + 1) * WORD_SIZE);
            }
            Location::Arg(index) => {
                self.check_arg(offset, index)?;
                if index < reg::ARGS.len() {
                    return Err(CompileError::Unsupported {
                        what: format!("address of register argument {index} at {offset:#010x}"),
                    });
                }
                let dst = self.st.alloc();
                let off = (index - reg::ARGS.len()) as i64 * WORD_SIZE;
                self.cb.symb_addr(dst, reg::FP, off);
            }
            Location::Captured(_) => {
                return Err(CompileError::Unsupported {
                    what: format!("address of captured variable at {offset:#010x}"),
                });
            }
        }
        Ok(())
    }

    fn check_global(&self, index: usize) -> CompileResult<()> {
        if index >= self.program.globals {
            return Err(CompileError::IndexOutOfBounds {
                kind: "global",
                index,
                count: self.program.globals,
            });
        }
        Ok(())
    }

    fn check_local(&self, offset: usize, index: usize) -> CompileResult<()> {
        let count = self.frame(offset)?.locals_count;
        if index >= count {
            return Err(CompileError::IndexOutOfBounds {
                kind: "local",
                index,
                count,
            });
        }
        Ok(())
    }

    fn check_arg(&self, offset: usize, index: usize) -> CompileResult<()> {
        let count = self.frame(offset)?.args_count;
        if index >= count {
            return Err(CompileError::IndexOutOfBounds {
                kind: "argument",
                index,
                count,
            });
        }
        Ok(())
    }

    /// The full calling convention. Spilled slots and the result slot are
    /// protected by lowering sp, ra and the caller-saved registers are pushed,
    /// arguments leave the symbolic stack for a0-a7 (after an optional
    /// synthetic leading argument) with the overflow pushed on the machine
    /// stack, and sp is padded to keep the call 16-byte aligned. Teardown
    /// mirrors the setup, but the temporaries reload from fixed offsets first
    /// so the result can leave a0 before the argument registers come back.
    fn compile_call(
        &mut self,
        offset: usize,
        target: CallTarget,
        argc: usize,
        leading: Option<i64>,
    ) -> CompileResult<()> {
        let locals = self.frame(offset)?.locals_count;
        let leading_count = usize::from(leading.is_some());
        let reg_argc = argc.min(reg::ARGS.len() - leading_count);
        let stack_args = argc - reg_argc;
        let pops = argc + usize::from(matches!(target, CallTarget::Closure));
        let result_slots = (self.st.depth() + 1)
            .saturating_sub(pops)
            .saturating_sub(reg::POOL.len());
        let protect = self.st.spilled_count().max(result_slots);
        let needs_pad = (locals + protect + stack_args) % 2 == 1;

        if protect > 0 {
            self.cb.comment(&format!("protect {protect} stack slots"));
            self.cb.addi(reg::SP, reg::SP, -(protect as i64) * WORD_SIZE);
        }

        self.push_reg(reg::RA);
        for r in reg::TEMPS {
            self.push_reg(r);
        }
        for r in reg::ARGS {
            self.push_reg(r);
        }

        if let Some(value) = leading {
            self.cb.li(reg::A0, value);
        }
        for i in 0..reg_argc {
            let src = self.st.pop()?;
            self.cb.symb_mv_to_reg(reg::arg(leading_count + i)?, src);
        }

        if needs_pad {
            self.cb.addi(reg::SP, reg::SP, -WORD_SIZE);
        }
        for _ in 0..stack_args {
            let src = self.st.pop()?;
            let r = self.cb.to_reg(src, reg::SCRATCH1);
            self.cb.sd(r, reg::SP, -WORD_SIZE);
            self.cb.addi(reg::SP, reg::SP, -WORD_SIZE);
        }

        match target {
            CallTarget::Name(name) => self.cb.call(name),
            CallTarget::Offset(entry) => {
                self.add_jump_target(entry, argc)?;
                self.cb.call(&label_for(entry));
            }
            CallTarget::Closure => {
                let closure = self.st.pop()?;
                let r = self.cb.to_reg(closure, reg::SCRATCH1);
                self.cb.mv(reg::CLOSURE, r);
                self.cb.ld(reg::SCRATCH1, r, 0);
                self.cb.jalr(reg::SCRATCH1);
            }
        }

        if stack_args > 0 {
            self.cb.addi(reg::SP, reg::SP, stack_args as i64 * WORD_SIZE);
        }
        if needs_pad {
            self.cb.addi(reg::SP, reg::SP, WORD_SIZE);
        }

        let args_bytes = reg::ARGS.len() as i64 * WORD_SIZE;
        for (i, r) in reg::TEMPS.iter().enumerate() {
            let off = args_bytes + (reg::TEMPS.len() - 1 - i) as i64 * WORD_SIZE;
            self.cb.ld(*r, reg::SP, off);
        }

        let dst = self.st.alloc();
        self.cb.symb_mv_from_reg(dst, reg::A0);

        for r in reg::ARGS.iter().rev() {
            self.cb.ld(*r, reg::SP, 0);
            self.cb.addi(reg::SP, reg::SP, WORD_SIZE);
        }
        let temps_bytes = (reg::TEMPS.len() + 1) as i64 * WORD_SIZE;
        self.cb.addi(reg::SP, reg::SP, temps_bytes);
        self.cb.ld(reg::RA, reg::SP, -WORD_SIZE);
        if protect > 0 {
            self.cb.addi(reg::SP, reg::SP, protect as i64 * WORD_SIZE);
        }
        Ok(())
    }

    fn push_reg(&mut self, r: Reg) {
        self.cb.sd(r, reg::SP, -WORD_SIZE);
        self.cb.addi(reg::SP, reg::SP, -WORD_SIZE);
    }

    /// Wrap the generated text with the data sections and the .text header.
    fn assemble(self) -> String {
        let mut out = String::new();
        out.push_str(".section .rodata\n");
        for (i, text) in self.program.strings.iter().enumerate() {
            out.push_str(&format!("string_{i}:\n.string \"{}\"\n", escape_asm(text)));
        }
        out.push_str(".section custom_data,\"aw\",@progbits\n");
        out.push_str(".fill 128, 8, 1\n");
        out.push_str(".data\n");
        out.push_str("saved_gp:\n.dword 0\n");
        out.push_str("globals:\n");
        out.push_str(&format!(".fill {}, 8, 0\n", self.program.globals));
        out.push_str(".text\n");
        for (name, _) in &self.program.publics {
            out.push_str(&format!(".global {name}\n"));
        }
        out.push_str(&self.cb.into_text());
        if !self.closure_offsets.is_empty() {
            out.push_str(".data\nclosures:\n");
            for entry in &self.closure_offsets {
                out.push_str(&format!(".dword {}\n", label_for(*entry)));
            }
        }
        out
    }
}

fn escape_asm(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Location;

    /// A program with a main prologue at 0, a plain function at 400 and a
    /// closure body at 500, enough for any single instruction to compile.
    fn fixture() -> Program {
        let mut insns = BTreeMap::new();
        insns.insert(
            0,
            Insn::Begin {
                name: Some("main".into()),
                nargs: 2,
                nlocals: 2,
                is_closure: false,
            },
        );
        insns.insert(
            400,
            Insn::Begin {
                name: None,
                nargs: 2,
                nlocals: 0,
                is_closure: false,
            },
        );
        insns.insert(
            500,
            Insn::Begin {
                name: None,
                nargs: 1,
                nlocals: 0,
                is_closure: true,
            },
        );
        Program {
            insns,
            strings: vec!["lit".into()],
            publics: vec![("main".into(), 0)],
            globals: 4,
        }
    }

    /// Emit one instruction at a synthetic depth and report the depth change.
    fn depth_delta(program: &Program, insn: &Insn, start: usize) -> CompileResult<i64> {
        let mut compiler = Compiler::new(program);
        compiler.current_frame = Some(FrameInfo {
            function_name: "main".into(),
            locals_count: 2,
            args_count: 2,
        });
        compiler.cb.set_frame_words(14);
        compiler.st.set_depth(start);
        compiler.emit_insn(100, insn)?;
        Ok(compiler.st.depth() as i64 - start as i64)
    }

    #[test]
    fn test_depth_conservation() {
        let program = fixture();
        let cases: Vec<(Insn, i64)> = vec![
            (Insn::Const(box_int(1)), 1),
            (Insn::String { index: 0, text: "lit".into() }, 1),
            (Insn::Sexp { tag: "cons".into(), nargs: 2 }, -1),
            (Insn::Sti, -1),
            (Insn::Sta, -2),
            (Insn::Jmp(400), 0),
            (Insn::Drop, -1),
            (Insn::Dup, 1),
            (Insn::Swap, 0),
            (Insn::Elem, -1),
            (Insn::CJmp { on_zero: true, target: 400 }, -1),
            (
                Insn::Closure {
                    entry: 500,
                    captures: vec![Location::Local(0), Location::Arg(1)],
                },
                1,
            ),
            (Insn::CallC { nargs: 2 }, -2),
            (Insn::Call { target: 400, nargs: 2 }, -1),
            (Insn::Tag { tag: "cons".into(), nargs: 2 }, 0),
            (Insn::Array(2), 0),
            (Insn::Fail { line: 2, col: 3 }, 0),
            (Insn::Line(7), 0),
            (Insn::Ld(Location::Global(1)), 1),
            (Insn::Ld(Location::Arg(0)), 1),
            (Insn::Lda(Location::Local(1)), 1),
            (Insn::St(Location::Local(0)), 0),
            (Insn::Patt(PattKind::String), -1),
            (Insn::Patt(PattKind::Boxed), 0),
            (Insn::Builtin(Builtin::Read), 1),
            (Insn::Builtin(Builtin::Write), 0),
            (Insn::Builtin(Builtin::Array(3)), -2),
            (Insn::Binop(BinopKind::Add), -1),
        ];
        // Once with every operand in a register, once with the deep slots
        // spilled to memory.
        for start in [5, 20] {
            for (insn, expected) in &cases {
                let delta = depth_delta(&program, insn, start).unwrap();
                assert_eq!(delta, *expected, "{insn} at depth {start}");
            }
        }
    }

    #[test]
    fn test_epilogue_pops_the_result() {
        let program = fixture();
        let delta = depth_delta(&program, &Insn::End, 5).unwrap();
        assert_eq!(delta, -1);
        let delta = depth_delta(&program, &Insn::Ret, 5).unwrap();
        assert_eq!(delta, -1);
    }

    #[test]
    fn test_jump_target_conflict_with_generated_code() {
        let program = fixture();
        let mut compiler = Compiler::new(&program);
        compiler.done.insert(8, 3);
        compiler.add_jump_target(8, 3).unwrap();
        assert!(compiler.todo.is_empty());
        assert!(matches!(
            compiler.add_jump_target(8, 4),
            Err(CompileError::DepthMismatch { offset: 8, expected: 3, found: 4 })
        ));
    }

    #[test]
    fn test_jump_target_conflict_with_pending_entry() {
        let program = fixture();
        let mut compiler = Compiler::new(&program);
        compiler.add_jump_target(16, 2).unwrap();
        compiler.add_jump_target(16, 2).unwrap();
        assert_eq!(compiler.todo.get(&16), Some(&2));
        assert!(matches!(
            compiler.add_jump_target(16, 5),
            Err(CompileError::DepthMismatch { offset: 16, expected: 2, found: 5 })
        ));
    }

    #[test]
    fn test_labels_are_placed_once() {
        let program = fixture();
        let mut compiler = Compiler::new(&program);
        compiler.st.set_depth(2);
        compiler.inst_begin(16).unwrap();
        compiler.inst_begin(16).unwrap();
        compiler.st.set_depth(3);
        assert!(matches!(
            compiler.inst_begin(16),
            Err(CompileError::DepthMismatch { offset: 16, expected: 2, found: 3 })
        ));
        let text = compiler.cb.into_text();
        assert_eq!(text.matches("label_for_16:").count(), 1);
        assert!(text.contains("# revisiting 0x00000010"));
    }

    #[test]
    fn test_closure_entries_reach_the_dispatch_table() {
        let program = fixture();
        let mut compiler = Compiler::new(&program);
        compiler.current_frame = Some(FrameInfo {
            function_name: "main".into(),
            locals_count: 2,
            args_count: 2,
        });
        compiler.cb.set_frame_words(14);
        compiler.st.set_depth(2);
        compiler
            .emit_insn(100, &Insn::Closure { entry: 500, captures: vec![] })
            .unwrap();
        let asm = compiler.assemble();
        assert!(asm.contains("closures:"));
        assert!(asm.contains(".dword label_for_500"));
    }

    #[test]
    fn test_no_dispatch_table_without_closures() {
        let program = fixture();
        let compiler = Compiler::new(&program);
        assert!(!compiler.assemble().contains("closures:"));
    }

    #[test]
    fn test_captured_access_is_unsupported() {
        let program = fixture();
        for insn in [
            Insn::Ld(Location::Captured(0)),
            Insn::St(Location::Captured(0)),
            Insn::Lda(Location::Captured(0)),
        ] {
            assert!(matches!(
                depth_delta(&program, &insn, 5),
                Err(CompileError::Unsupported { .. })
            ));
        }
    }

    #[test]
    fn test_location_bounds() {
        let program = fixture();
        assert!(matches!(
            depth_delta(&program, &Insn::Ld(Location::Global(4)), 5),
            Err(CompileError::IndexOutOfBounds { kind: "global", index: 4, count: 4 })
        ));
        assert!(matches!(
            depth_delta(&program, &Insn::Ld(Location::Local(2)), 5),
            Err(CompileError::IndexOutOfBounds { kind: "local", index: 2, count: 2 })
        ));
        assert!(matches!(
            depth_delta(&program, &Insn::St(Location::Arg(2)), 5),
            Err(CompileError::IndexOutOfBounds { kind: "argument", index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_underflow_is_reported() {
        let program = fixture();
        assert!(matches!(
            depth_delta(&program, &Insn::Binop(BinopKind::Add), 1),
            Err(CompileError::StackUnderflow)
        ));
    }

    #[test]
    fn test_escape_asm() {
        assert_eq!(escape_asm("plain"), "plain");
        assert_eq!(escape_asm("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(escape_asm("line\nbreak\ttab"), "line\\nbreak\\ttab");
    }
}

// This module implements the symbolic operand stack. The compiler never materializes stack
// values at run time when it can help it: each logical stack slot is statically assigned a
// home, the first fifteen slots living in the register pool and deeper slots in numbered
// spill slots inside the current frame. Because the assignment depends only on the depth,
// the whole stack state is a single counter, and control-flow merges are checked by
// comparing counters. pop and peek report underflow instead of panicking; alloc hands out
// the next slot's location, and push re-accounts a value whose location did not change.

//! The symbolic operand stack.

use crate::error::{CompileError, CompileResult};

use super::reg::{self, Reg};

/// Where a symbolic stack slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Register(Reg),
    /// Spill slot number, counting from the first slot past the register pool.
    Memory(usize),
}

/// Operand stack modeled by a single depth counter.
#[derive(Debug, Default)]
pub struct SymbolicStack {
    top: usize,
}

impl SymbolicStack {
    pub fn new() -> Self {
        Self { top: 0 }
    }

    /// The home of the slot at a given depth.
    fn loc_at(depth: usize) -> Loc {
        if depth < reg::POOL.len() {
            Loc::Register(reg::POOL[depth])
        } else {
            Loc::Memory(depth - reg::POOL.len())
        }
    }

    /// Reserve the next slot and return its location.
    pub fn alloc(&mut self) -> Loc {
        let loc = Self::loc_at(self.top);
        self.top += 1;
        loc
    }

    /// Re-push a value that stayed in place after a pop.
    pub fn push(&mut self, _kept: Loc) {
        self.top += 1;
    }

    /// Release the top slot and return where its value lives.
    pub fn pop(&mut self) -> CompileResult<Loc> {
        if self.top == 0 {
            return Err(CompileError::StackUnderflow);
        }
        self.top -= 1;
        Ok(Self::loc_at(self.top))
    }

    /// Location of the top slot without releasing it.
    pub fn peek(&self) -> CompileResult<Loc> {
        if self.top == 0 {
            return Err(CompileError::StackUnderflow);
        }
        Ok(Self::loc_at(self.top - 1))
    }

    pub fn depth(&self) -> usize {
        self.top
    }

    /// Reset to a known depth when tracing resumes at a recorded offset.
    pub fn set_depth(&mut self, depth: usize) {
        self.top = depth;
    }

    /// Number of slots currently spilled past the register pool.
    pub fn spilled_count(&self) -> usize {
        self.top.saturating_sub(reg::POOL.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_walks_the_pool() {
        let mut st = SymbolicStack::new();
        assert_eq!(st.alloc(), Loc::Register(reg::POOL[0]));
        assert_eq!(st.alloc(), Loc::Register(reg::POOL[1]));
        assert_eq!(st.depth(), 2);
    }

    #[test]
    fn test_pop_mirrors_alloc() {
        let mut st = SymbolicStack::new();
        let a = st.alloc();
        let b = st.alloc();
        assert_eq!(st.pop().unwrap(), b);
        assert_eq!(st.pop().unwrap(), a);
        assert!(matches!(st.pop(), Err(CompileError::StackUnderflow)));
    }

    #[test]
    fn test_peek_keeps_depth() {
        let mut st = SymbolicStack::new();
        let a = st.alloc();
        assert_eq!(st.peek().unwrap(), a);
        assert_eq!(st.depth(), 1);
    }

    #[test]
    fn test_spill_boundary() {
        let mut st = SymbolicStack::new();
        st.set_depth(reg::POOL.len());
        assert_eq!(st.alloc(), Loc::Memory(0));
        assert_eq!(st.alloc(), Loc::Memory(1));
        assert_eq!(st.spilled_count(), 2);
    }

    #[test]
    fn test_last_pool_slot() {
        let mut st = SymbolicStack::new();
        st.set_depth(reg::POOL.len() - 1);
        assert_eq!(st.alloc(), Loc::Register(reg::POOL[reg::POOL.len() - 1]));
        assert_eq!(st.spilled_count(), 0);
    }

    #[test]
    fn test_depth_reset() {
        let mut st = SymbolicStack::new();
        st.set_depth(20);
        assert_eq!(st.depth(), 20);
        assert_eq!(st.spilled_count(), 5);
        assert_eq!(st.pop().unwrap(), Loc::Memory(4));
    }
}

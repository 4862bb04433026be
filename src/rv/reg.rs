// This module defines the RV64 register model used by the code generator. Reg wraps the
// architectural x-number and prints as the ABI name. The fixed register roles are: sp/fp
// frame the function, gp holds the base of the global area for the whole program run, t0
// carries the closure value into a closure call, and t5/t6 are reserved as scratch for
// resolving spilled symbolic-stack slots and never back a stack slot themselves. POOL lists
// the fifteen registers backing symbolic stack slots in allocation order (s1-s11 first, then
// t1-t4); SAVED lists the twelve callee-saved registers every prologue spills; TEMPS lists
// the caller-saved temporaries preserved around calls; ARGS lists a0-a7.

//! Register roles and fixed tables.

use std::fmt;

use crate::error::{CompileError, CompileResult};

/// A physical RV64 register, identified by its x-number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

pub const ZERO: Reg = Reg(0);
pub const RA: Reg = Reg(1);
pub const SP: Reg = Reg(2);
/// Base of the global area, set up once in the premain sequence.
pub const GP: Reg = Reg(3);
/// Carries the closure value into a closure body.
pub const CLOSURE: Reg = Reg(5);
pub const FP: Reg = Reg(8);
pub const A0: Reg = Reg(10);

/// Scratch registers for resolving spilled operands. Never part of POOL.
pub const SCRATCH1: Reg = Reg(30);
pub const SCRATCH2: Reg = Reg(31);

/// Registers backing symbolic stack slots, in allocation order.
pub const POOL: [Reg; 15] = [
    Reg(9),  // s1
    Reg(18), // s2
    Reg(19), // s3
    Reg(20), // s4
    Reg(21), // s5
    Reg(22), // s6
    Reg(23), // s7
    Reg(24), // s8
    Reg(25), // s9
    Reg(26), // s10
    Reg(27), // s11
    Reg(6),  // t1
    Reg(7),  // t2
    Reg(28), // t3
    Reg(29), // t4
];

/// Callee-saved registers every prologue spills, in save order.
pub const SAVED: [Reg; 12] = [
    Reg(8),  // fp
    Reg(9),  // s1
    Reg(18), // s2
    Reg(19), // s3
    Reg(20), // s4
    Reg(21), // s5
    Reg(22), // s6
    Reg(23), // s7
    Reg(24), // s8
    Reg(25), // s9
    Reg(26), // s10
    Reg(27), // s11
];

/// Caller-saved temporaries preserved around calls, in save order.
pub const TEMPS: [Reg; 7] = [
    Reg(5),  // t0
    Reg(6),  // t1
    Reg(7),  // t2
    Reg(28), // t3
    Reg(29), // t4
    Reg(30), // t5
    Reg(31), // t6
];

/// Argument registers a0 through a7.
pub const ARGS: [Reg; 8] = [
    Reg(10),
    Reg(11),
    Reg(12),
    Reg(13),
    Reg(14),
    Reg(15),
    Reg(16),
    Reg(17),
];

/// The i-th argument register.
pub fn arg(index: usize) -> CompileResult<Reg> {
    ARGS.get(index)
        .copied()
        .ok_or(CompileError::ArgRegisterOutOfRange { index })
}

const REG_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match REG_NAMES.get(self.0 as usize) {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "x{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(ZERO.to_string(), "zero");
        assert_eq!(GP.to_string(), "gp");
        assert_eq!(FP.to_string(), "fp");
        assert_eq!(POOL[0].to_string(), "s1");
        assert_eq!(POOL[11].to_string(), "t1");
        assert_eq!(POOL[14].to_string(), "t4");
        assert_eq!(SCRATCH1.to_string(), "t5");
        assert_eq!(SCRATCH2.to_string(), "t6");
    }

    #[test]
    fn test_arg_registers() {
        assert_eq!(arg(0).unwrap(), A0);
        assert_eq!(arg(7).unwrap().to_string(), "a7");
        assert!(matches!(
            arg(8),
            Err(CompileError::ArgRegisterOutOfRange { index: 8 })
        ));
    }

    #[test]
    fn test_scratch_stays_out_of_the_pool() {
        assert!(!POOL.contains(&SCRATCH1));
        assert!(!POOL.contains(&SCRATCH2));
        assert!(!POOL.contains(&CLOSURE));
    }

    #[test]
    fn test_pool_is_preserved_around_calls() {
        // Every pool register is either callee-saved or re-loaded from the
        // temp save area, so stack slots survive a call.
        for reg in POOL {
            assert!(SAVED.contains(&reg) || TEMPS.contains(&reg), "{reg} unprotected");
        }
    }
}

//! The decoded instruction model.
//!
//! An [`Instruction`] immutably describes a fixed byte range of the code
//! stream once decoded. CFG construction may flag it [`InstFlags::DEAD`], and
//! register allocation rewrites its register references and literal indices,
//! but instructions are never deleted or reordered: jump targets are byte
//! offsets, and removing an instruction would invalidate every offset after it.

use bitflags::bitflags;
use strum::Display;

use crate::bytecode::opcode::OperandShape;

/// Classification of a literal-pool index.
///
/// The five classes partition index space by the function's boundary values:
/// `argument_end <= register_end <= ident_end <= const_literal_end <= literal_end`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LiteralType {
    /// Formal argument slot (`index < argument_end`).
    Argument,
    /// Local register slot (`index < register_end`).
    Register,
    /// Named identifier (`index < ident_end`).
    Ident,
    /// Constant value (`index < const_literal_end`).
    Constant,
    /// Template object (`index < literal_end`).
    Template,
}

/// A decoded literal reference: classification plus pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal {
    /// Which boundary range the index fell into.
    pub ty: LiteralType,
    /// The literal-pool index.
    pub index: u16,
}

impl Literal {
    /// Shifts the stored index by `delta` (used when register compaction
    /// moves the non-register part of the pool down).
    pub fn shift_index(&mut self, delta: i32) {
        let shifted = i32::from(self.index) + delta;
        debug_assert!(shifted >= 0, "literal index shifted below zero");
        self.index = shifted as u16;
    }
}

bitflags! {
    /// Per-instruction flags, set during decoding and CFG construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstFlags: u32 {
        /// Transfers control to `jump_target()`.
        const JUMP = 1 << 0;
        /// The jump is conditional.
        const CONDITIONAL_JUMP = 1 << 1;
        /// Opens a try region.
        const TRY_START = 1 << 2;
        /// Catch entry marker.
        const TRY_CATCH = 1 << 3;
        /// Finally entry marker.
        const TRY_FINALLY = 1 << 4;
        /// Opens an iteration context.
        const CTX_INIT = 1 << 5;
        /// Fetches the next iteration value.
        const CTX_GET_NEXT = 1 << 6;
        /// Iteration continuation test.
        const CTX_HAS_NEXT = 1 << 7;
        /// Writes a register (see [`Instruction::write_reg`]).
        const WRITE_REG = 1 << 8;
        /// Reads one or more registers (see [`Instruction::read_regs`]).
        const READ_REG = 1 << 9;
        /// Unreachable: sits after an unconditional jump and before the next leader.
        /// Kept in the stream for offset stability, skipped on re-encode.
        const DEAD = 1 << 10;
    }
}

/// The decoded operands of one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operands {
    /// The operand grammar this instruction was decoded with.
    pub shape: OperandShape,
    /// Branch displacement relative to the instruction start, sign-corrected
    /// (negative for backward branches). Only meaningful for `Branch` shapes.
    pub branch_offset: i32,
    /// Net abstract stack effect of stack-consuming shapes.
    pub stack_delta: i32,
    /// Literal references, in stream order.
    pub literals: Vec<Literal>,
}

impl Operands {
    /// Operands for a shape with no stream bytes.
    #[must_use]
    pub fn none(shape: OperandShape) -> Self {
        Self {
            shape,
            branch_offset: 0,
            stack_delta: 0,
            literals: Vec::new(),
        }
    }
}

/// One decoded bytecode operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Byte offset of the opcode within the function's code region.
    pub offset: u32,
    /// Encoded size in bytes.
    pub size: u32,
    /// Numeric opcode; extended operations are `EXT_OPCODE_BASE + byte`.
    pub opcode: u16,
    /// Mnemonic from the opcode table.
    pub name: &'static str,
    /// Decoded operands.
    pub operands: Operands,
    /// Instruction flags.
    pub flags: InstFlags,
    /// Registers read by this instruction (literal-pool indices below `register_end`).
    pub read_regs: Vec<u16>,
    /// Register written by this instruction, if any.
    pub write_reg: Option<u16>,
}

impl Instruction {
    /// Returns `true` if `flag` is set.
    #[must_use]
    pub fn has(&self, flag: InstFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Sets `flag`.
    pub fn add_flag(&mut self, flag: InstFlags) {
        self.flags.insert(flag);
    }

    /// Returns `true` for any control transfer.
    #[must_use]
    pub fn is_jump(&self) -> bool {
        self.has(InstFlags::JUMP)
    }

    /// Returns `true` for conditional control transfers.
    #[must_use]
    pub fn is_conditional_jump(&self) -> bool {
        self.has(InstFlags::CONDITIONAL_JUMP)
    }

    /// Returns `true` for try/catch/finally markers.
    #[must_use]
    pub fn is_try_context(&self) -> bool {
        self.flags
            .intersects(InstFlags::TRY_START | InstFlags::TRY_CATCH | InstFlags::TRY_FINALLY)
    }

    /// Signed branch displacement relative to this instruction's offset.
    ///
    /// # Panics
    ///
    /// Panics if this instruction is not a jump.
    #[must_use]
    pub fn jump_offset(&self) -> i32 {
        assert!(self.is_jump(), "jump_offset on a non-jump instruction");
        self.operands.branch_offset
    }

    /// Absolute byte offset of the branch target.
    ///
    /// # Panics
    ///
    /// Panics if this instruction is not a jump.
    #[must_use]
    pub fn jump_target(&self) -> u32 {
        let target = i64::from(self.offset) + i64::from(self.jump_offset());
        debug_assert!(target >= 0, "branch target before function start");
        target as u32
    }

    /// Byte offset of the next instruction in stream order.
    #[must_use]
    pub const fn next_offset(&self) -> u32 {
        self.offset + self.size
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has(InstFlags::DEAD) {
            write!(f, "<dead> ")?;
        }

        write!(f, "{:#06x}: {}", self.offset, self.name)?;

        if self.is_jump() {
            write!(
                f,
                " {:+}(->{:#06x})",
                self.operands.branch_offset,
                self.jump_target()
            )?;
        }

        if !self.operands.literals.is_empty() {
            write!(f, " lits: (")?;
            for (i, lit) in self.operands.literals.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", lit.index)?;
            }
            write!(f, ")")?;
        }

        if self.has(InstFlags::READ_REG) {
            write!(f, " read: {:?}", self.read_regs)?;
        }

        if let Some(reg) = self.write_reg {
            write!(f, " write: {reg}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode::OperandShape;

    fn jump_inst(offset: u32, branch_offset: i32) -> Instruction {
        Instruction {
            offset,
            size: 2,
            opcode: 0x10,
            name: "jump_forward",
            operands: Operands {
                shape: OperandShape::Branch,
                branch_offset,
                stack_delta: 0,
                literals: Vec::new(),
            },
            flags: InstFlags::JUMP,
            read_regs: Vec::new(),
            write_reg: None,
        }
    }

    #[test]
    fn jump_target_forward_and_backward() {
        assert_eq!(jump_inst(10, 6).jump_target(), 16);
        assert_eq!(jump_inst(10, -4).jump_target(), 6);
    }

    #[test]
    #[should_panic(expected = "non-jump")]
    fn jump_offset_requires_jump_flag() {
        let mut inst = jump_inst(0, 4);
        inst.flags = InstFlags::empty();
        let _ = inst.jump_offset();
    }

    #[test]
    fn literal_shift() {
        let mut lit = Literal {
            ty: LiteralType::Ident,
            index: 10,
        };
        lit.shift_index(-3);
        assert_eq!(lit.index, 7);
    }

    #[test]
    fn display_marks_dead() {
        let mut inst = jump_inst(4, 2);
        inst.add_flag(InstFlags::DEAD);
        assert!(inst.to_string().starts_with("<dead>"));
    }
}

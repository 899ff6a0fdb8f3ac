//! The instruction stream decoder.
//!
//! [`Decoder`] walks a function's code region one instruction at a time,
//! driven by an injected [`OpcodeTable`]. Besides producing the typed
//! [`Instruction`] records it simulates the operand stack with abstract
//! value slots, which is how register reads routed through the stack are
//! discovered and recorded on the consuming instruction. Liveness analysis
//! depends on the read/write facts produced here; only the decoder sees the
//! raw operand shapes needed to derive them.
//!
//! Running out of bytes, hitting the end-of-function opcode, and hitting the
//! escape byte with nothing after it all terminate decoding normally. Only
//! reserved opcode slots and out-of-range literal indices are errors.

use tracing::trace;

use crate::{
    bytecode::{
        function::LiteralBoundaries,
        instruction::{InstFlags, Instruction, Literal, LiteralType, Operands},
        opcode::{OpcodeData, OpcodeFlags, OpcodeTable, OperandShape, EXT_OPCODE_BASE},
    },
    Result,
};

/// One abstract operand-stack slot.
///
/// Pushes of a register-classified literal record where the value came from,
/// so the instruction that eventually pops it can be marked as reading that
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// A value of unknown provenance.
    Any,
    /// A value pushed from the given register slot.
    Register(u16),
}

/// Stateful cursor over one function's code region.
pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    table: &'a OpcodeTable,
    bounds: &'a LiteralBoundaries,
    stack: Vec<Slot>,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8], table: &'a OpcodeTable, bounds: &'a LiteralBoundaries) -> Self {
        Self {
            bytes,
            pos: 0,
            table,
            bounds,
            stack: Vec::new(),
        }
    }

    /// Current cursor position in bytes.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Decodes the next instruction, advancing the cursor past it.
    ///
    /// Returns `Ok(None)` when the stream has ended: cursor past the last
    /// byte, end-of-function opcode, or an escape byte with no second byte.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for reserved opcode slots and for
    /// literal indices outside the pool.
    pub fn decode_next(&mut self) -> Result<Option<Instruction>> {
        let start = self.pos;

        let Some(first) = self.read_byte() else {
            return Ok(None);
        };

        let opcode = if first == self.table.escape() {
            let Some(second) = self.read_byte() else {
                return Ok(None);
            };
            EXT_OPCODE_BASE + u16::from(second)
        } else {
            u16::from(first)
        };

        let Some(data) = self.table.get(opcode) else {
            return Err(malformed_error!(
                "reserved opcode {:#06x} at offset {:#x}",
                opcode,
                start
            ));
        };

        if data.flags.contains(OpcodeFlags::END) {
            return Ok(None);
        }

        let mut inst = Instruction {
            offset: start as u32,
            size: 0,
            opcode,
            name: data.name,
            operands: Operands::none(data.shape),
            flags: inst_flags_for(data.flags),
            read_regs: Vec::new(),
            write_reg: None,
        };

        match data.shape {
            OperandShape::None | OperandShape::Stack | OperandShape::StackStack => {}
            OperandShape::Branch => {
                let Some(offset) = self.read_branch_offset(data) else {
                    return Ok(None);
                };
                inst.operands.branch_offset = offset;
            }
            OperandShape::Literal | OperandShape::ThisLiteral | OperandShape::StackLiteral => {
                if !self.decode_literal(&mut inst, data, true)? {
                    return Ok(None);
                }
            }
            OperandShape::LiteralLiteral => {
                if !self.decode_literal(&mut inst, data, true)?
                    || !self.decode_literal(&mut inst, data, false)?
                {
                    return Ok(None);
                }
            }
        }

        self.simulate_stack(&mut inst, data);

        inst.size = (self.pos - start) as u32;
        inst.operands.stack_delta = i32::from(data.pushes) - i32::from(data.pops);

        trace!("decoded {inst}");
        Ok(Some(inst))
    }

    fn read_byte(&mut self) -> Option<u8> {
        let byte = self.bytes.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    /// Reads `data.branch_len` big-endian magnitude bytes and applies the
    /// direction carried by the opcode.
    fn read_branch_offset(&mut self, data: &OpcodeData) -> Option<i32> {
        let mut magnitude: u32 = 0;
        for _ in 0..data.branch_len {
            magnitude = (magnitude << 8) | u32::from(self.read_byte()?);
        }

        if data.flags.contains(OpcodeFlags::BACKWARD) {
            Some(-(magnitude as i32))
        } else {
            Some(magnitude as i32)
        }
    }

    /// Decodes one literal index, classifies it and records the register
    /// read/write facts it implies. Returns `Ok(false)` if the stream ended
    /// inside the index.
    fn decode_literal(
        &mut self,
        inst: &mut Instruction,
        data: &OpcodeData,
        first: bool,
    ) -> Result<bool> {
        let Some(index) = self.read_literal_index() else {
            return Ok(false);
        };
        let ty = self.bounds.classify(index)?;

        inst.operands.literals.push(Literal { ty, index });

        if matches!(ty, LiteralType::Argument | LiteralType::Register) {
            if first && data.flags.contains(OpcodeFlags::WRITE_FIRST_LITERAL) {
                inst.write_reg = Some(index);
                inst.add_flag(InstFlags::WRITE_REG);
            } else {
                mark_read(inst, index);
            }
        }

        Ok(true)
    }

    /// One byte below the encoding limit, else two bytes combined big-endian
    /// and corrected by the encoding delta.
    fn read_literal_index(&mut self) -> Option<u16> {
        let hi = u16::from(self.read_byte()?);
        if hi < self.bounds.encoding_limit {
            return Some(hi);
        }

        let lo = u16::from(self.read_byte()?);
        Some(((hi << 8) | lo).wrapping_sub(self.bounds.encoding_delta))
    }

    /// Applies the instruction's abstract stack effect. Popping a slot that
    /// carries register provenance marks the popping instruction as a reader
    /// of that register.
    fn simulate_stack(&mut self, inst: &mut Instruction, data: &OpcodeData) {
        for _ in 0..data.pops {
            // A short stack means the pushing side sits on another control
            // flow path; treat the missing slot as an unknown value.
            let slot = self.stack.pop().unwrap_or(Slot::Any);
            if let Slot::Register(reg) = slot {
                mark_read(inst, reg);
            }
        }

        for _ in 0..data.pushes {
            self.stack.push(Slot::Any);
        }

        // A lone register push propagates its provenance to the new slot.
        if data.pushes == 1 && data.pops == 0 && data.shape == OperandShape::Literal {
            if let Some(&reg) = inst.read_regs.first() {
                if let Some(top) = self.stack.last_mut() {
                    *top = Slot::Register(reg);
                }
            }
        }
    }
}

/// Static opcode attributes carried over onto the decoded instruction.
fn inst_flags_for(flags: OpcodeFlags) -> InstFlags {
    let mut out = InstFlags::empty();

    for (opcode_flag, inst_flag) in [
        (OpcodeFlags::JUMP, InstFlags::JUMP),
        (OpcodeFlags::CONDITIONAL, InstFlags::CONDITIONAL_JUMP),
        (OpcodeFlags::TRY_START, InstFlags::TRY_START),
        (OpcodeFlags::TRY_CATCH, InstFlags::TRY_CATCH),
        (OpcodeFlags::TRY_FINALLY, InstFlags::TRY_FINALLY),
        (OpcodeFlags::CTX_INIT, InstFlags::CTX_INIT),
        (OpcodeFlags::CTX_GET_NEXT, InstFlags::CTX_GET_NEXT),
        (OpcodeFlags::CTX_HAS_NEXT, InstFlags::CTX_HAS_NEXT),
    ] {
        if flags.contains(opcode_flag) {
            out.insert(inst_flag);
        }
    }

    out
}

fn mark_read(inst: &mut Instruction, reg: u16) {
    if !inst.read_regs.contains(&reg) {
        inst.read_regs.push(reg);
    }
    inst.add_flag(InstFlags::READ_REG);
}

/// Decodes a whole code region into an instruction list in stream order.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for reserved opcodes and out-of-range
/// literal indices.
pub fn decode_function(
    bytes: &[u8],
    table: &OpcodeTable,
    bounds: &LiteralBoundaries,
) -> Result<Vec<Instruction>> {
    let mut decoder = Decoder::new(bytes, table, bounds);
    let mut instructions = Vec::new();

    while let Some(inst) = decoder.decode_next()? {
        instructions.push(inst);
    }

    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{function::FunctionFlags, opcode::ops};

    fn bounds() -> LiteralBoundaries {
        // 2 arguments, 4 local registers, then idents/constants/templates.
        LiteralBoundaries::new(FunctionFlags::empty(), 2, 6, 10, 14, 320, 8).unwrap()
    }

    fn decode(code: &[u8]) -> Vec<Instruction> {
        let table = OpcodeTable::default_set();
        decode_function(code, &table, &bounds()).unwrap()
    }

    #[test]
    fn straight_line_decode() {
        let code = [
            ops::PUSH_LITERAL as u8,
            7, // ident
            ops::STORE as u8,
            2, // register destination
            ops::RETURN_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
        ];

        let insts = decode(&code);
        assert_eq!(insts.len(), 3);

        assert_eq!(insts[0].offset, 0);
        assert_eq!(insts[0].size, 2);
        assert_eq!(insts[0].operands.literals[0].ty, LiteralType::Ident);

        assert_eq!(insts[1].offset, 2);
        assert_eq!(insts[1].write_reg, Some(2));
        assert!(insts[1].has(InstFlags::WRITE_REG));
        assert!(insts[1].read_regs.is_empty());

        assert_eq!(insts[2].offset, 4);
        assert_eq!(insts[2].name, "return_undefined");
    }

    #[test]
    fn end_opcode_terminates_before_trailing_bytes() {
        let code = [
            ops::PUSH_UNDEFINED as u8,
            ops::END_FUNCTION as u8,
            ops::PUSH_UNDEFINED as u8,
        ];
        assert_eq!(decode(&code).len(), 1);
    }

    #[test]
    fn exhausted_mid_escape_terminates() {
        let code = [ops::PUSH_UNDEFINED as u8, ops::EXT_ESCAPE];
        assert_eq!(decode(&code).len(), 1);
    }

    #[test]
    fn escape_selects_extended_table() {
        let code = [ops::EXT_ESCAPE, (ops::FOR_IN_GET_NEXT - EXT_OPCODE_BASE) as u8];
        let insts = decode(&code);

        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].opcode, ops::FOR_IN_GET_NEXT);
        assert_eq!(insts[0].size, 2);
        assert!(insts[0].has(InstFlags::CTX_GET_NEXT));
    }

    #[test]
    fn reserved_opcode_is_malformed() {
        let table = OpcodeTable::default_set();
        let err = decode_function(&[0xF0], &table, &bounds()).unwrap_err();
        assert!(matches!(err, crate::Error::Malformed { .. }));
    }

    #[test]
    fn two_byte_literal_index() {
        // Small encoding: a first byte of 255 combines with the next byte,
        // corrected by 0xFE01. (0xFF << 8 | 45) - 0xFE01 == 300.
        let code = [ops::PUSH_LITERAL as u8, 0xFF, 45];
        let insts = decode(&code);

        assert_eq!(insts[0].size, 3);
        assert_eq!(insts[0].operands.literals[0].index, 300);
        assert_eq!(insts[0].operands.literals[0].ty, LiteralType::Template);
    }

    #[test]
    fn full_encoding_two_byte_index() {
        let full = LiteralBoundaries::new(
            FunctionFlags::FULL_LITERAL_ENCODING,
            0,
            0,
            0,
            0,
            400,
            8,
        )
        .unwrap();
        let table = OpcodeTable::default_set();

        // (0x81 << 8 | 0x02) - 0x8000 == 258.
        let code = [ops::PUSH_LITERAL as u8, 0x81, 0x02];
        let insts = decode_function(&code, &table, &full).unwrap();
        assert_eq!(insts[0].operands.literals[0].index, 258);
    }

    #[test]
    fn literal_index_out_of_range_is_malformed() {
        let tight = LiteralBoundaries::new(FunctionFlags::empty(), 0, 0, 0, 0, 4, 8).unwrap();
        let table = OpcodeTable::default_set();

        let err = decode_function(&[ops::PUSH_LITERAL as u8, 9], &table, &tight).unwrap_err();
        assert!(matches!(err, crate::Error::Malformed { .. }));
    }

    #[test]
    fn backward_branch_is_sign_corrected() {
        let code = [
            ops::PUSH_UNDEFINED as u8,
            ops::PUSH_UNDEFINED as u8,
            ops::JUMP_BACKWARD as u8,
            2,
        ];
        let insts = decode(&code);

        let jump = &insts[2];
        assert_eq!(jump.operands.branch_offset, -2);
        assert_eq!(jump.jump_target(), 0);
    }

    #[test]
    fn wide_branch_offsets_accumulate_big_endian() {
        let code = [(ops::JUMP_FORWARD + 1) as u8, 0x01, 0x04];
        let insts = decode(&code);

        assert_eq!(insts[0].size, 3);
        assert_eq!(insts[0].operands.branch_offset, 0x0104);
    }

    #[test]
    fn register_read_marked_at_operand_decode() {
        // move r2 <- r3: first literal is the destination, second a read.
        let code = [ops::MOVE as u8, 2, 3];
        let insts = decode(&code);

        assert_eq!(insts[0].write_reg, Some(2));
        assert_eq!(insts[0].read_regs, vec![3]);
        assert!(insts[0].has(InstFlags::READ_REG));
    }

    #[test]
    fn stack_provenance_reaches_consumer() {
        // push r3, push const, add: the add consumes the register value.
        let code = [
            ops::PUSH_LITERAL as u8,
            3,
            ops::PUSH_LITERAL as u8,
            11,
            ops::ADD as u8,
        ];
        let insts = decode(&code);

        assert_eq!(insts[0].read_regs, vec![3]);
        assert_eq!(insts[2].read_regs, vec![3]);
        assert_eq!(insts[2].operands.stack_delta, -1);
    }

    #[test]
    fn argument_operand_counts_as_register_read() {
        let code = [ops::PUSH_LITERAL as u8, 1];
        let insts = decode(&code);

        assert_eq!(insts[0].operands.literals[0].ty, LiteralType::Argument);
        assert_eq!(insts[0].read_regs, vec![1]);
    }

    #[test]
    fn conditional_branch_carries_both_jump_flags() {
        let code = [
            ops::PUSH_UNDEFINED as u8,
            ops::BRANCH_IF_FALSE_FORWARD as u8,
            4,
        ];
        let insts = decode(&code);

        let branch = &insts[1];
        assert!(branch.is_jump());
        assert!(branch.is_conditional_jump());
        assert_eq!(branch.jump_target(), 5);
    }
}

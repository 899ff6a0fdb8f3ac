//! Opcode lookup tables.
//!
//! The decoder is driven entirely by an [`OpcodeTable`]: a pair of immutable
//! arrays mapping the first code byte (or, after the escape byte, the second)
//! to an [`OpcodeData`] record describing the operand shape, attribute flags,
//! branch offset width and abstract stack effect of the operation. The table
//! is constructed once and passed by reference into every decode call, so
//! alternative encodings (or synthetic test tables) can coexist.

use bitflags::bitflags;
use strum::Display;

/// Extended opcodes are numbered `EXT_OPCODE_BASE + second_byte`.
pub const EXT_OPCODE_BASE: u16 = 256;

/// The operand grammar of an opcode.
///
/// Shapes combining `Stack` consume operands that earlier instructions pushed;
/// shapes naming `Literal` read one or two variable-length literal indices
/// from the stream.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// No operand bytes follow the opcode.
    None,
    /// A variable-length (1-3 byte) branch offset follows.
    Branch,
    /// Consumes one stack value; no operand bytes.
    Stack,
    /// Consumes two stack values; no operand bytes.
    StackStack,
    /// One literal index follows.
    Literal,
    /// Two literal indices follow.
    LiteralLiteral,
    /// One literal index follows and one stack value is consumed.
    StackLiteral,
    /// One literal index follows; the implicit `this` value is the other operand.
    ThisLiteral,
}

bitflags! {
    /// Static attributes of an opcode, consulted by the decoder and the CFG builder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpcodeFlags: u32 {
        /// Transfers control to a branch target.
        const JUMP = 1 << 0;
        /// The jump is conditional; the fall-through path remains reachable.
        const CONDITIONAL = 1 << 1;
        /// The branch offset points backwards in the stream.
        const BACKWARD = 1 << 2;
        /// Opens a try region; the branch target is the catch entry.
        const TRY_START = 1 << 3;
        /// Marks the catch entry; the branch target is the finally entry or merge point.
        const TRY_CATCH = 1 << 4;
        /// Marks the finally entry.
        const TRY_FINALLY = 1 << 5;
        /// Opens an iteration context (for-in / for-of); the branch delimits the context.
        const CTX_INIT = 1 << 6;
        /// Fetches the next value of an iteration context.
        const CTX_GET_NEXT = 1 << 7;
        /// Tests an iteration context for remaining values; branches back when non-empty.
        const CTX_HAS_NEXT = 1 << 8;
        /// Terminates the function body; decoding stops here.
        const END = 1 << 9;
        /// The first literal operand is the destination of a register write.
        const WRITE_FIRST_LITERAL = 1 << 10;
        /// The result of the operation is pushed onto the operand stack.
        const PUT_STACK = 1 << 11;
    }
}

/// The static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeData {
    /// Mnemonic, empty for reserved encodings.
    pub name: &'static str,
    /// Operand grammar.
    pub shape: OperandShape,
    /// Attribute flags.
    pub flags: OpcodeFlags,
    /// Number of branch offset bytes (1-3), zero for non-branch shapes.
    pub branch_len: u8,
    /// Abstract stack slots consumed.
    pub pops: u8,
    /// Abstract stack slots produced.
    pub pushes: u8,
}

impl OpcodeData {
    const fn new(
        name: &'static str,
        shape: OperandShape,
        flags: OpcodeFlags,
        branch_len: u8,
        pops: u8,
        pushes: u8,
    ) -> Self {
        Self {
            name,
            shape,
            flags,
            branch_len,
            pops,
            pushes,
        }
    }

    const fn reserved() -> Self {
        Self::new("", OperandShape::None, OpcodeFlags::empty(), 0, 0, 0)
    }

    /// Returns `true` for table slots with no assigned operation.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.name.is_empty()
    }
}

/// Well-known opcode values of the built-in encoding.
///
/// Branch opcodes come in families of three: the base value uses a one byte
/// offset, `+1` two bytes, `+2` three bytes.
pub mod ops {
    /// End of the function body.
    pub const END_FUNCTION: u16 = 0x00;
    /// Escape byte selecting the extended table.
    pub const EXT_ESCAPE: u8 = 0x01;
    /// Push one literal.
    pub const PUSH_LITERAL: u16 = 0x02;
    /// Push two literals.
    pub const PUSH_TWO_LITERALS: u16 = 0x03;
    /// Push undefined.
    pub const PUSH_UNDEFINED: u16 = 0x04;
    /// Discard the top of stack.
    pub const POP: u16 = 0x05;
    /// Copy the second literal into the first (register destination).
    pub const MOVE: u16 = 0x06;
    /// Store the top of stack into the literal destination.
    pub const STORE: u16 = 0x07;
    /// Binary addition.
    pub const ADD: u16 = 0x08;
    /// Binary subtraction.
    pub const SUB: u16 = 0x09;
    /// Unary negation.
    pub const NEG: u16 = 0x0A;
    /// Push a property of `this` named by the literal.
    pub const PUSH_THIS_PROPERTY: u16 = 0x0B;
    /// Return the top of stack.
    pub const RETURN: u16 = 0x0C;
    /// Return undefined.
    pub const RETURN_UNDEFINED: u16 = 0x0D;
    /// Call the value on the top of the stack, pushing the result.
    pub const CALL: u16 = 0x0E;

    /// Unconditional forward jump (1 byte offset; `+1`/`+2` widen).
    pub const JUMP_FORWARD: u16 = 0x10;
    /// Unconditional backward jump.
    pub const JUMP_BACKWARD: u16 = 0x13;
    /// Conditional forward branch, taken when the popped value is false.
    pub const BRANCH_IF_FALSE_FORWARD: u16 = 0x16;
    /// Conditional backward branch, taken when the popped value is true.
    pub const BRANCH_IF_TRUE_BACKWARD: u16 = 0x19;

    /// Open a try region; target is the catch entry.
    pub const TRY_CREATE: u16 = 0x1C;
    /// Catch marker; target is the finally entry or the merge point.
    pub const CATCH: u16 = 0x1D;
    /// Finally marker.
    pub const FINALLY: u16 = 0x1E;

    /// for-in context open (extended table).
    pub const FOR_IN_INIT: u16 = super::EXT_OPCODE_BASE + 0x01;
    /// for-in fetch next.
    pub const FOR_IN_GET_NEXT: u16 = super::EXT_OPCODE_BASE + 0x02;
    /// for-in has-next test, branching back while values remain.
    pub const FOR_IN_HAS_NEXT: u16 = super::EXT_OPCODE_BASE + 0x03;
    /// for-of context open.
    pub const FOR_OF_INIT: u16 = super::EXT_OPCODE_BASE + 0x04;
    /// for-of fetch next.
    pub const FOR_OF_GET_NEXT: u16 = super::EXT_OPCODE_BASE + 0x05;
    /// for-of has-next test.
    pub const FOR_OF_HAS_NEXT: u16 = super::EXT_OPCODE_BASE + 0x06;
}

/// Immutable opcode lookup tables for one encoding.
///
/// Initialized once, read-only thereafter; the decoder borrows it for every
/// call and never mutates it.
pub struct OpcodeTable {
    base: Vec<OpcodeData>,
    ext: Vec<OpcodeData>,
    escape: u8,
}

impl OpcodeTable {
    /// Creates a table from explicit base and extended entries.
    ///
    /// Both slices are padded with reserved entries up to 256 slots.
    #[must_use]
    pub fn new(base: Vec<OpcodeData>, ext: Vec<OpcodeData>, escape: u8) -> Self {
        let mut base = base;
        let mut ext = ext;
        base.resize(256, OpcodeData::reserved());
        ext.resize(256, OpcodeData::reserved());
        Self { base, ext, escape }
    }

    /// The escape byte selecting the extended table.
    #[must_use]
    pub const fn escape(&self) -> u8 {
        self.escape
    }

    /// Looks up the data for a (possibly extended) opcode.
    ///
    /// Returns `None` for reserved slots.
    #[must_use]
    pub fn get(&self, opcode: u16) -> Option<&OpcodeData> {
        let entry = if opcode >= EXT_OPCODE_BASE {
            self.ext.get((opcode - EXT_OPCODE_BASE) as usize)?
        } else {
            self.base.get(opcode as usize)?
        };

        if entry.is_reserved() {
            None
        } else {
            Some(entry)
        }
    }

    /// The opcode carrying [`OpcodeFlags::END`], if the table defines one.
    #[must_use]
    pub fn end_opcode(&self) -> Option<u16> {
        self.base
            .iter()
            .position(|data| data.flags.contains(OpcodeFlags::END))
            .map(|idx| idx as u16)
    }

    /// The built-in instruction set this crate targets.
    #[must_use]
    pub fn default_set() -> Self {
        use OperandShape as Sh;

        let jump = OpcodeFlags::JUMP;
        let cond = OpcodeFlags::JUMP.union(OpcodeFlags::CONDITIONAL);
        let back = OpcodeFlags::BACKWARD;
        let put = OpcodeFlags::PUT_STACK;

        let mut base = vec![OpcodeData::reserved(); 256];

        base[ops::END_FUNCTION as usize] =
            OpcodeData::new("end_function", Sh::None, OpcodeFlags::END, 0, 0, 0);
        // ops::EXT_ESCAPE stays reserved: it is a prefix, not an operation.
        base[ops::PUSH_LITERAL as usize] =
            OpcodeData::new("push_literal", Sh::Literal, put, 0, 0, 1);
        base[ops::PUSH_TWO_LITERALS as usize] =
            OpcodeData::new("push_two_literals", Sh::LiteralLiteral, put, 0, 0, 2);
        base[ops::PUSH_UNDEFINED as usize] =
            OpcodeData::new("push_undefined", Sh::None, put, 0, 0, 1);
        base[ops::POP as usize] = OpcodeData::new("pop", Sh::Stack, OpcodeFlags::empty(), 0, 1, 0);
        base[ops::MOVE as usize] = OpcodeData::new(
            "move",
            Sh::LiteralLiteral,
            OpcodeFlags::WRITE_FIRST_LITERAL,
            0,
            0,
            0,
        );
        base[ops::STORE as usize] = OpcodeData::new(
            "store",
            Sh::StackLiteral,
            OpcodeFlags::WRITE_FIRST_LITERAL,
            0,
            1,
            0,
        );
        base[ops::ADD as usize] = OpcodeData::new("add", Sh::StackStack, put, 0, 2, 1);
        base[ops::SUB as usize] = OpcodeData::new("sub", Sh::StackStack, put, 0, 2, 1);
        base[ops::NEG as usize] = OpcodeData::new("neg", Sh::Stack, put, 0, 1, 1);
        base[ops::PUSH_THIS_PROPERTY as usize] =
            OpcodeData::new("push_this_property", Sh::ThisLiteral, put, 0, 0, 1);
        base[ops::RETURN as usize] =
            OpcodeData::new("return", Sh::Stack, OpcodeFlags::empty(), 0, 1, 0);
        base[ops::RETURN_UNDEFINED as usize] =
            OpcodeData::new("return_undefined", Sh::None, OpcodeFlags::empty(), 0, 0, 0);
        base[ops::CALL as usize] = OpcodeData::new("call", Sh::Stack, put, 0, 1, 1);

        for (i, width) in [(0u16, 1u8), (1, 2), (2, 3)] {
            base[(ops::JUMP_FORWARD + i) as usize] =
                OpcodeData::new("jump_forward", Sh::Branch, jump, width, 0, 0);
            base[(ops::JUMP_BACKWARD + i) as usize] =
                OpcodeData::new("jump_backward", Sh::Branch, jump.union(back), width, 0, 0);
            base[(ops::BRANCH_IF_FALSE_FORWARD + i) as usize] =
                OpcodeData::new("branch_if_false_forward", Sh::Branch, cond, width, 1, 0);
            base[(ops::BRANCH_IF_TRUE_BACKWARD + i) as usize] = OpcodeData::new(
                "branch_if_true_backward",
                Sh::Branch,
                cond.union(back),
                width,
                1,
                0,
            );
        }

        base[ops::TRY_CREATE as usize] = OpcodeData::new(
            "try_create",
            Sh::Branch,
            jump.union(OpcodeFlags::TRY_START),
            2,
            0,
            0,
        );
        base[ops::CATCH as usize] = OpcodeData::new(
            "catch",
            Sh::Branch,
            jump.union(OpcodeFlags::TRY_CATCH),
            2,
            0,
            0,
        );
        base[ops::FINALLY as usize] = OpcodeData::new(
            "finally",
            Sh::Branch,
            jump.union(OpcodeFlags::TRY_FINALLY),
            2,
            0,
            0,
        );

        let mut ext = vec![OpcodeData::reserved(); 256];

        for (init, get_next, has_next) in [
            (ops::FOR_IN_INIT, ops::FOR_IN_GET_NEXT, ops::FOR_IN_HAS_NEXT),
            (ops::FOR_OF_INIT, ops::FOR_OF_GET_NEXT, ops::FOR_OF_HAS_NEXT),
        ] {
            ext[(init - EXT_OPCODE_BASE) as usize] = OpcodeData::new(
                "ctx_init",
                Sh::Branch,
                jump.union(OpcodeFlags::CTX_INIT),
                2,
                1,
                0,
            );
            ext[(get_next - EXT_OPCODE_BASE) as usize] = OpcodeData::new(
                "ctx_get_next",
                Sh::None,
                put.union(OpcodeFlags::CTX_GET_NEXT),
                0,
                0,
                1,
            );
            ext[(has_next - EXT_OPCODE_BASE) as usize] = OpcodeData::new(
                "ctx_has_next",
                Sh::Branch,
                cond.union(back).union(OpcodeFlags::CTX_HAS_NEXT),
                2,
                0,
                0,
            );
        }

        Self::new(base, ext, ops::EXT_ESCAPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_lookup() {
        let table = OpcodeTable::default_set();

        let add = table.get(ops::ADD).unwrap();
        assert_eq!(add.name, "add");
        assert_eq!(add.shape, OperandShape::StackStack);
        assert_eq!(add.pops, 2);
        assert_eq!(add.pushes, 1);

        let jump = table.get(ops::JUMP_FORWARD + 2).unwrap();
        assert_eq!(jump.branch_len, 3);
        assert!(jump.flags.contains(OpcodeFlags::JUMP));
        assert!(!jump.flags.contains(OpcodeFlags::BACKWARD));
    }

    #[test]
    fn extended_lookup() {
        let table = OpcodeTable::default_set();

        let has_next = table.get(ops::FOR_IN_HAS_NEXT).unwrap();
        assert!(has_next.flags.contains(OpcodeFlags::CTX_HAS_NEXT));
        assert!(has_next.flags.contains(OpcodeFlags::BACKWARD));
        assert!(has_next.flags.contains(OpcodeFlags::CONDITIONAL));
    }

    #[test]
    fn reserved_slots_are_none() {
        let table = OpcodeTable::default_set();
        assert!(table.get(0xF0).is_none());
        assert!(table.get(EXT_OPCODE_BASE + 0xF0).is_none());
        assert!(table.get(u16::from(ops::EXT_ESCAPE)).is_none());
    }
}

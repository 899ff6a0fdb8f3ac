//! The per-function bytecode unit.
//!
//! A [`Function`] owns everything the pipeline touches for one compiled
//! function: header flags, the literal boundary indices, the literal pool,
//! the raw code bytes, the decoded instruction list with its offset index,
//! the basic-block arena and the per-register live ranges. Passes mutate it
//! in place; nothing is shared between functions.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::{
    analysis::{cfg::BlockArena, liveness::LiveInterval},
    bytecode::{
        decoder::decode_function,
        instruction::{Instruction, LiteralType},
        opcode::OpcodeTable,
    },
    Result,
};

/// One-byte literal indices are used below this limit in the small encoding.
pub const SMALL_ENCODING_LIMIT: u16 = 255;
/// Two-byte correction constant of the small encoding.
pub const SMALL_ENCODING_DELTA: u16 = 0xFE01;
/// One-byte limit of the full encoding.
pub const FULL_ENCODING_LIMIT: u16 = 128;
/// Two-byte correction constant of the full encoding.
pub const FULL_ENCODING_DELTA: u16 = 0x8000;

bitflags! {
    /// Function header status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u16 {
        /// Boundary counts are stored as 16-bit values (8-bit otherwise).
        const UINT16_ARGUMENTS = 1 << 0;
        /// Literal indices use the full encoding (limit 128) instead of the small one.
        const FULL_LITERAL_ENCODING = 1 << 1;
        /// A mapped-arguments object trailer is present.
        const MAPPED_ARGUMENTS_NEEDED = 1 << 2;
        /// An extended-info trailer is present.
        const HAS_EXTENDED_INFO = 1 << 3;
        /// A tagged-template-literal trailer is present.
        const HAS_TAGGED_LITERALS = 1 << 4;
    }
}

/// The boundary indices partitioning literal-pool index space, plus the
/// encoding parameters derived from the header flags.
///
/// Invariant: `argument_end <= register_end <= ident_end <= const_literal_end
/// <= literal_end`. Every literal decode classifies its index into exactly one
/// of the five ranges these delimit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralBoundaries {
    /// End of the formal-argument slots.
    pub argument_end: u16,
    /// End of the register slots.
    pub register_end: u16,
    /// End of the named identifiers.
    pub ident_end: u16,
    /// End of the constant literals.
    pub const_literal_end: u16,
    /// Total pool size.
    pub literal_end: u16,
    /// Operand stack depth limit.
    pub stack_limit: u16,
    /// One-byte literal index limit.
    pub encoding_limit: u16,
    /// Two-byte literal index correction.
    pub encoding_delta: u16,
}

impl LiteralBoundaries {
    /// Creates boundaries with the encoding selected by `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the boundaries are not monotone.
    pub fn new(
        flags: FunctionFlags,
        argument_end: u16,
        register_end: u16,
        ident_end: u16,
        const_literal_end: u16,
        literal_end: u16,
        stack_limit: u16,
    ) -> Result<Self> {
        if argument_end > register_end
            || register_end > ident_end
            || ident_end > const_literal_end
            || const_literal_end > literal_end
        {
            return Err(malformed_error!(
                "literal boundaries not monotone: {} {} {} {} {}",
                argument_end,
                register_end,
                ident_end,
                const_literal_end,
                literal_end
            ));
        }

        let (encoding_limit, encoding_delta) =
            if flags.contains(FunctionFlags::FULL_LITERAL_ENCODING) {
                (FULL_ENCODING_LIMIT, FULL_ENCODING_DELTA)
            } else {
                (SMALL_ENCODING_LIMIT, SMALL_ENCODING_DELTA)
            };

        Ok(Self {
            argument_end,
            register_end,
            ident_end,
            const_literal_end,
            literal_end,
            stack_limit,
            encoding_limit,
            encoding_delta,
        })
    }

    /// Number of local register slots (arguments excluded).
    #[must_use]
    pub const fn local_register_count(&self) -> u16 {
        self.register_end - self.argument_end
    }

    /// Number of register slots including arguments.
    #[must_use]
    pub const fn register_count(&self) -> u16 {
        self.register_end
    }

    /// Classifies a literal-pool index into its boundary range.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if `index >= literal_end`.
    pub fn classify(&self, index: u16) -> Result<LiteralType> {
        if index < self.argument_end {
            Ok(LiteralType::Argument)
        } else if index < self.register_end {
            Ok(LiteralType::Register)
        } else if index < self.ident_end {
            Ok(LiteralType::Ident)
        } else if index < self.const_literal_end {
            Ok(LiteralType::Constant)
        } else if index < self.literal_end {
            Ok(LiteralType::Template)
        } else {
            Err(malformed_error!(
                "literal index {} out of range (literal_end {})",
                index,
                self.literal_end
            ))
        }
    }

    /// Shrinks the register range by `delta` slots, shifting every later
    /// boundary down. Called by the allocator's rewrite phase.
    pub fn shrink_registers(&mut self, delta: u16) {
        debug_assert!(delta <= self.local_register_count());
        self.register_end -= delta;
        self.ident_end -= delta;
        self.const_literal_end -= delta;
        self.literal_end -= delta;
    }
}

/// The function's literal pool: opaque values indexable `0..literal_end`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiteralPool {
    values: Vec<u64>,
}

impl LiteralPool {
    /// Wraps a vector of raw literal values.
    #[must_use]
    pub fn new(values: Vec<u64>) -> Self {
        Self { values }
    }

    /// Number of pool entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the pool holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the raw value at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn get(&self, index: u16) -> u64 {
        self.values[index as usize]
    }

    /// Raw pool contents.
    #[must_use]
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Removes `delta` freed register slots ending at `old_register_end`,
    /// moving everything after them down.
    pub fn compact_registers(&mut self, old_register_end: u16, delta: u16) {
        let end = old_register_end as usize;
        let start = end - delta as usize;
        self.values.drain(start..end);
    }
}

/// One function's bytecode and all per-function analysis state.
#[derive(Debug)]
pub struct Function {
    flags: FunctionFlags,
    bounds: LiteralBoundaries,
    pool: LiteralPool,
    code: Vec<u8>,
    /// Decoded instructions in stream order. Owned here; blocks reference them
    /// by index.
    pub instructions: Vec<Instruction>,
    /// Byte offset -> index into `instructions`, for O(1) jump-target resolution.
    pub offset_map: HashMap<u32, usize>,
    /// The basic-block arena, populated by CFG construction.
    pub blocks: BlockArena,
    /// Register id -> ordered disjoint live intervals, populated by liveness.
    pub live_ranges: HashMap<u16, Vec<LiveInterval>>,
}

impl Function {
    /// Creates a function unit from its raw parts. Instructions are not yet
    /// decoded; call [`Function::decode`].
    #[must_use]
    pub fn new(
        flags: FunctionFlags,
        bounds: LiteralBoundaries,
        pool: LiteralPool,
        code: Vec<u8>,
    ) -> Self {
        Self {
            flags,
            bounds,
            pool,
            code,
            instructions: Vec::new(),
            offset_map: HashMap::new(),
            blocks: BlockArena::new(),
            live_ranges: HashMap::new(),
        }
    }

    /// Header flags.
    #[must_use]
    pub const fn flags(&self) -> FunctionFlags {
        self.flags
    }

    /// Literal boundaries.
    #[must_use]
    pub const fn bounds(&self) -> &LiteralBoundaries {
        &self.bounds
    }

    /// Mutable literal boundaries (allocator rewrite only).
    pub fn bounds_mut(&mut self) -> &mut LiteralBoundaries {
        &mut self.bounds
    }

    /// The literal pool.
    #[must_use]
    pub const fn pool(&self) -> &LiteralPool {
        &self.pool
    }

    /// Mutable literal pool (allocator rewrite only).
    pub fn pool_mut(&mut self) -> &mut LiteralPool {
        &mut self.pool
    }

    /// The raw code bytes this unit was created from.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Decodes the code region into the instruction list and offset index.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] on reserved opcodes or out-of-range
    /// literal indices.
    pub fn decode(&mut self, table: &OpcodeTable) -> Result<()> {
        let instructions = decode_function(&self.code, table, &self.bounds)?;

        self.offset_map = instructions
            .iter()
            .enumerate()
            .map(|(idx, inst)| (inst.offset, idx))
            .collect();
        self.instructions = instructions;

        Ok(())
    }

    /// Index of the instruction starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not an instruction boundary: jump targets are
    /// produced by a trusted front end, so a miss is a contract violation,
    /// not a recoverable condition.
    #[must_use]
    pub fn inst_index_at(&self, offset: u32) -> usize {
        match self.offset_map.get(&offset) {
            Some(&idx) => idx,
            None => panic!("offset {offset:#x} is not an instruction boundary"),
        }
    }

    /// The instruction starting at `offset` (same contract as [`Function::inst_index_at`]).
    #[must_use]
    pub fn inst_at(&self, offset: u32) -> &Instruction {
        &self.instructions[self.inst_index_at(offset)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(arg_end: u16, reg_end: u16) -> LiteralBoundaries {
        LiteralBoundaries::new(
            FunctionFlags::empty(),
            arg_end,
            reg_end,
            reg_end + 2,
            reg_end + 4,
            reg_end + 6,
            8,
        )
        .unwrap()
    }

    #[test]
    fn classify_partitions_index_space() {
        let b = bounds(2, 5);

        assert_eq!(b.classify(0).unwrap(), LiteralType::Argument);
        assert_eq!(b.classify(1).unwrap(), LiteralType::Argument);
        assert_eq!(b.classify(2).unwrap(), LiteralType::Register);
        assert_eq!(b.classify(4).unwrap(), LiteralType::Register);
        assert_eq!(b.classify(5).unwrap(), LiteralType::Ident);
        assert_eq!(b.classify(7).unwrap(), LiteralType::Constant);
        assert_eq!(b.classify(9).unwrap(), LiteralType::Template);
        assert!(b.classify(11).is_err());
    }

    #[test]
    fn non_monotone_boundaries_rejected() {
        assert!(LiteralBoundaries::new(FunctionFlags::empty(), 3, 2, 4, 5, 6, 0).is_err());
    }

    #[test]
    fn encoding_selected_by_flags() {
        let small = bounds(0, 0);
        assert_eq!(small.encoding_limit, SMALL_ENCODING_LIMIT);
        assert_eq!(small.encoding_delta, SMALL_ENCODING_DELTA);

        let full = LiteralBoundaries::new(
            FunctionFlags::FULL_LITERAL_ENCODING,
            0,
            0,
            0,
            0,
            0,
            0,
        )
        .unwrap();
        assert_eq!(full.encoding_limit, FULL_ENCODING_LIMIT);
        assert_eq!(full.encoding_delta, FULL_ENCODING_DELTA);
    }

    #[test]
    fn shrink_registers_shifts_boundaries() {
        let mut b = bounds(1, 4);
        b.shrink_registers(2);
        assert_eq!(b.register_end, 2);
        assert_eq!(b.ident_end, 4);
        assert_eq!(b.const_literal_end, 6);
        assert_eq!(b.literal_end, 8);
    }

    #[test]
    fn pool_compaction_drains_freed_slots() {
        let mut pool = LiteralPool::new(vec![10, 11, 12, 13, 14, 15]);
        // Registers end at index 4; free the last two register slots.
        pool.compact_registers(4, 2);
        assert_eq!(pool.values(), &[10, 11, 14, 15]);
    }
}
